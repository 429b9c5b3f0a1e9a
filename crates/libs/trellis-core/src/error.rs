#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResourceFailure {
    HashMismatch,
    RetriesExhausted,
    LinkClosed,
    Aborted,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TrellisError {
    OutOfMemory,
    InvalidArgument,
    MalformedPacket,
    SignatureInvalid,
    HashMismatch,
    Replay,
    RateLimited,
    NoPath,
    HandshakeTimeout,
    LinkClosed,
    ResourceFailed(ResourceFailure),
    CryptoError,
}
