use std::io;

use super::VirtualInterface;

/// Interface that accepts and discards everything
pub struct NoopInterface;

impl NoopInterface {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for NoopInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualInterface for NoopInterface {
    fn inject(&self, _datagram: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn forward(&self, _datagram: &[u8]) -> io::Result<()> {
        Ok(())
    }
}
