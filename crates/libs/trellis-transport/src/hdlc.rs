use trellis_core::error::TrellisError;

const HDLC_FRAME_FLAG: u8 = 0x7e;
const HDLC_ESCAPE_BYTE: u8 = 0x7d;
const HDLC_ESCAPE_MASK: u8 = 0b0010_0000;

/// HDLC-style byte framing for serial-like host transports. Runs on the
/// host side of the engine boundary, so frames are plain vectors.
pub struct Hdlc {}

impl Hdlc {
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 2);
        out.push(HDLC_FRAME_FLAG);

        for &byte in data {
            match byte {
                HDLC_FRAME_FLAG | HDLC_ESCAPE_BYTE => {
                    out.push(HDLC_ESCAPE_BYTE);
                    out.push(byte ^ HDLC_ESCAPE_MASK);
                }
                _ => out.push(byte),
            }
        }

        out.push(HDLC_FRAME_FLAG);
        out
    }

    /// Returns start and end index of the first complete frame, if any.
    pub fn find(data: &[u8]) -> Option<(usize, usize)> {
        let mut start_index: Option<usize> = None;

        for (i, &byte) in data.iter().enumerate() {
            if byte != HDLC_FRAME_FLAG {
                continue;
            }

            match start_index {
                None => start_index = Some(i),
                // Adjacent flags delimit an empty frame; keep scanning.
                Some(start) if i > start + 1 => return Some((start, i)),
                Some(_) => start_index = Some(i),
            }
        }

        None
    }

    pub fn decode(data: &[u8]) -> Result<Vec<u8>, TrellisError> {
        let mut out = Vec::with_capacity(data.len());
        let mut started = false;
        let mut escape = false;

        for &byte in data {
            if escape {
                escape = false;
                out.push(byte ^ HDLC_ESCAPE_MASK);
                continue;
            }

            match byte {
                HDLC_FRAME_FLAG => {
                    if started && !out.is_empty() {
                        return Ok(out);
                    }
                    started = true;
                }
                HDLC_ESCAPE_BYTE => escape = true,
                _ => {
                    if started {
                        out.push(byte);
                    }
                }
            }
        }

        Err(TrellisError::MalformedPacket)
    }
}
