use trellis_core::hash::AddressHash;

pub type InterfaceId = AddressHash;

/// Declared routing role of a link-layer attachment. Feeds path expiry and
/// announce re-flood policy; the engine never calls into an interface.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum InterfaceMode {
    Full,
    PointToPoint,
    AccessPoint,
    Roaming,
    Boundary,
    Gateway,
}

impl InterfaceMode {
    /// Path lifetime for routes learned over an interface of this mode.
    pub fn path_expiry_secs(&self) -> f64 {
        match self {
            InterfaceMode::AccessPoint => 24.0 * 3600.0,
            InterfaceMode::Roaming => 6.0 * 3600.0,
            _ => 7.0 * 24.0 * 3600.0,
        }
    }
}

/// Capability record for a registered interface. Framing and I/O belong to
/// the host; the engine only consumes the metadata.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDesc {
    pub id: InterfaceId,
    pub nominal_bps: u64,
    pub mtu: usize,
    pub mode: InterfaceMode,
    pub up: bool,
}

impl InterfaceDesc {
    pub fn new(id: InterfaceId, nominal_bps: u64, mtu: usize, mode: InterfaceMode) -> Self {
        Self { id, nominal_bps, mtu, mode, up: true }
    }
}

#[cfg(test)]
mod tests {
    use super::InterfaceMode;

    #[test]
    fn mode_expiry_ordering() {
        assert!(
            InterfaceMode::Roaming.path_expiry_secs()
                < InterfaceMode::AccessPoint.path_expiry_secs()
        );
        assert!(
            InterfaceMode::AccessPoint.path_expiry_secs() < InterfaceMode::Full.path_expiry_secs()
        );
    }
}
