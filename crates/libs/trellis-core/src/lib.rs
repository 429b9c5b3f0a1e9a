//! Core primitives for the Trellis mesh stack: hashes, identities, the
//! encrypted token construction, the wire packet codec, destinations and
//! announces, and ratchet key management. Everything here is pure and
//! runtime-free; transports and scheduling live in `trellis-transport`.

pub mod buffer;
pub mod crypt;
pub mod destination;
pub mod error;
pub mod hash;
pub mod identity;
pub mod packet;
pub mod ratchet;

pub use error::{ResourceFailure, TrellisError};
pub use hash::{AddressHash, Hash};
pub use packet::{
    DestinationType, Packet, PacketContext, PacketDataBuffer, PacketHash, PacketType,
};
