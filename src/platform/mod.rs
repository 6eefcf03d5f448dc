//! Platform adapters for the virtual network interface.
//!
//! The OS tunnel (a VPN service on mobile, a TUN device elsewhere) is owned by
//! the host application. The capture core only needs to write datagrams back
//! through it, either towards the device or out to the network.

use std::io;

mod channel;
mod noop;

pub use channel::{ChannelInterface, InterfaceFrame};
pub use noop::NoopInterface;

pub trait VirtualInterface: Send + Sync {
    /// Deliver a datagram to the device, as if it arrived from the network
    fn inject(&self, datagram: &[u8]) -> io::Result<()>;

    /// Send a datagram towards the remote peer on behalf of the device
    fn forward(&self, datagram: &[u8]) -> io::Result<()>;
}
