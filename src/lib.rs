//! Per-processor UDP datapath for a QUIC transport stack.
//!
//! The datapath owns the kernel sockets, drives I/O readiness through a
//! per-core event queue, and hands fully addressed datagrams (including the
//! local address they arrived on) to an upper-layer receive callback. Sends
//! are batched and may carry an explicit source address, encoded as PKTINFO
//! control messages.
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
compile_error!("quic-datapath requires epoll or kqueue and PKTINFO control messages");

mod addr;
mod binding;
mod cmsg;
mod datagram;
mod datapath;
mod pool;
mod proc;
mod rundown;
mod send;
mod socket;

pub use addr::{Addr, Tuple};
pub use binding::{Binding, Param};
pub use datagram::{ChainIter, Datagram, DatagramChain};
pub use datapath::{Datapath, DatapathConfig, DatapathEvents, Partitioner};
pub use send::{SendContext, SendOutcome};

use std::io;

use thiserror::Error;

/// Largest MTU the datapath will assume for a binding.
pub const MAX_MTU: u16 = 1500;
/// Minimum IPv4 header size, used to derive the payload cap.
pub const MIN_IPV4_HEADER_SIZE: u16 = 20;
/// UDP header size.
pub const UDP_HEADER_SIZE: u16 = 8;
/// Largest UDP payload a single datagram may carry.
pub const MAX_UDP_PAYLOAD_LENGTH: usize =
    (MAX_MTU - MIN_IPV4_HEADER_SIZE - UDP_HEADER_SIZE) as usize;
/// Most datagram buffers a single send context may hold.
pub const MAX_SEND_BATCH_SIZE: usize = 10;

/// Capabilities the datapath supports on the current platform.
///
/// The per-core engine offers neither segmentation offload nor receive
/// coalescing, so every field reports `false`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Features {
    /// Large sends are split into MTU-sized datagrams by the kernel or NIC.
    pub send_segmentation: bool,
    /// Multiple datagrams may be coalesced into a single receive.
    pub recv_coalescing: bool,
}

/// Errors surfaced by datapath operations.
#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("address in use")]
    AddressInUse,
    #[error("access denied")]
    AccessDenied,
    #[error("hostname did not resolve to a usable address")]
    DnsResolution,
    #[error("event queue registration failed: {0}")]
    Internal(io::Error),
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for DatapathError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::PermissionDenied => Self::AccessDenied,
            _ => Self::Io(err),
        }
    }
}
