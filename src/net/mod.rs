use thiserror::Error;

pub mod checksum;
pub mod device;
pub mod ip;
pub mod stack;
pub mod tcp;
pub mod tun;

pub use checksum::checksum;
pub use ip::Ipv4Header;
pub use stack::TcpStack;
pub use tcp::{TcpFlags, TcpHeader};

/// Why an inbound datagram could not be decoded. These are counted and the
/// packet is dropped; the stack keeps running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("bad header length {0}")]
    HeaderLen(usize),
    #[error("checksum mismatch: {0:#06x}")]
    Checksum(u16),
}
