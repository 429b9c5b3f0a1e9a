use core::fmt;

use crate::error::TrellisError;

/// Fixed-capacity payload buffer. Packets embed one of these directly, so
/// the type stays `Copy` and never allocates; overflowing the capacity is
/// an error, not a panic.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct FrameBuffer<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FrameBuffer<N> {
    pub const fn empty() -> Self {
        Self { bytes: [0u8; N], len: 0 }
    }

    /// Copies `data` in, truncating at capacity.
    pub fn from_slice(data: &[u8]) -> Self {
        let len = data.len().min(N);
        let mut bytes = [0u8; N];
        bytes[..len].copy_from_slice(&data[..len]);
        Self { bytes, len }
    }

    /// Concatenates several segments, failing if the total overflows. This
    /// is how multi-field payloads (announces, proofs) are assembled.
    pub fn from_parts(parts: &[&[u8]]) -> Result<Self, TrellisError> {
        let mut buffer = Self::empty();
        buffer.extend(parts)?;
        Ok(buffer)
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), TrellisError> {
        let end = self.len.checked_add(data.len()).ok_or(TrellisError::OutOfMemory)?;
        if end > N {
            return Err(TrellisError::OutOfMemory);
        }
        self.bytes[self.len..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    pub fn extend(&mut self, parts: &[&[u8]]) -> Result<(), TrellisError> {
        for part in parts {
            self.push(part)?;
        }
        Ok(())
    }

    /// Hands the whole capacity to `fill`, which writes in place and
    /// reports how many bytes it produced. Used to tokenize payloads
    /// without an intermediate copy.
    pub fn fill_with<F>(&mut self, fill: F) -> Result<(), TrellisError>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, TrellisError>,
    {
        let written = fill(&mut self.bytes)?;
        if written > N {
            return Err(TrellisError::OutOfMemory);
        }
        self.len = written;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }
}

impl<const N: usize> Default for FrameBuffer<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Display for FrameBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::FrameBuffer;
    use crate::error::TrellisError;

    #[test]
    fn push_respects_capacity() {
        let mut buffer = FrameBuffer::<4>::empty();
        assert!(buffer.push(&[1, 2, 3]).is_ok());
        assert_eq!(buffer.push(&[4, 5]), Err(TrellisError::OutOfMemory));
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn from_slice_truncates() {
        let buffer = FrameBuffer::<4>::from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn from_parts_concatenates() {
        let buffer = FrameBuffer::<8>::from_parts(&[&[1, 2], &[], &[3]]).expect("fits");
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);

        assert!(FrameBuffer::<2>::from_parts(&[&[1, 2], &[3]]).is_err());
    }

    #[test]
    fn fill_with_sets_length() {
        let mut buffer = FrameBuffer::<8>::empty();
        buffer
            .fill_with(|out| {
                out[..3].copy_from_slice(&[7, 8, 9]);
                Ok(3)
            })
            .expect("fill");
        assert_eq!(buffer.as_slice(), &[7, 8, 9]);
    }
}
