//! Wire-level primitives: consensus serialization, hashing, outpoints and
//! network addresses.

pub mod encoding;
pub mod hash;
pub mod netaddr;
pub mod outpoint;

pub use encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{sha256, sha256d};
pub use netaddr::{AddrFamily, NetAddr};
pub use outpoint::OutPoint;
