use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use super::VirtualInterface;

/// A datagram written through a [`ChannelInterface`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceFrame {
    ToDevice(Vec<u8>),
    ToNetwork(Vec<u8>),
}

impl InterfaceFrame {
    pub fn bytes(&self) -> &[u8] {
        match self {
            InterfaceFrame::ToDevice(b) | InterfaceFrame::ToNetwork(b) => b,
        }
    }
}

/// Interface that hands every datagram to a channel, in write order
///
/// Useful for hosts that pump the tunnel from another thread, and for tests.
pub struct ChannelInterface {
    tx: Mutex<Sender<InterfaceFrame>>,
}

impl ChannelInterface {
    pub fn new() -> (Self, Receiver<InterfaceFrame>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn send(&self, frame: InterfaceFrame) -> io::Result<()> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface receiver dropped"))
    }
}

impl VirtualInterface for ChannelInterface {
    fn inject(&self, datagram: &[u8]) -> io::Result<()> {
        self.send(InterfaceFrame::ToDevice(datagram.to_vec()))
    }

    fn forward(&self, datagram: &[u8]) -> io::Result<()> {
        self.send(InterfaceFrame::ToNetwork(datagram.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_keep_their_order_and_side() {
        let (iface, rx) = ChannelInterface::new();
        iface.inject(b"a").unwrap();
        iface.forward(b"b").unwrap();
        iface.inject(b"c").unwrap();

        let frames: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            frames,
            vec![
                InterfaceFrame::ToDevice(b"a".to_vec()),
                InterfaceFrame::ToNetwork(b"b".to_vec()),
                InterfaceFrame::ToDevice(b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn dropped_receiver_is_an_io_error() {
        let (iface, rx) = ChannelInterface::new();
        drop(rx);
        assert_eq!(
            iface.inject(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
