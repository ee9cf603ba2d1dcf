//! Pluggable network transport.
//!
//! The session layer speaks to the network only through the [`Connector`]
//! seam: one reliable byte stream per session plus an optional connected
//! datagram channel. Tests substitute loopback or scripted connectors.

pub mod tcp;

use std::io::{self, Read, Write};
use std::time::Duration;

pub use tcp::SocketConnector;

/// A connected reliable stream split into independently owned halves, plus
/// a closer that unblocks a reader parked in a blocking read. The closer
/// must be safe to call more than once and from any thread.
pub struct StreamPair {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub closer: Box<dyn Fn() + Send + Sync>,
}

pub trait PacketSend: Send {
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;
}

pub trait PacketReceive: Send {
    /// Receives one whole datagram into `buf`, returning its length.
    /// Blocks up to the connector's read timeout; a timeout surfaces as
    /// `WouldBlock` or `TimedOut`.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A connected unreliable packet channel.
pub struct PacketPair {
    pub sender: Box<dyn PacketSend>,
    pub receiver: Box<dyn PacketReceive>,
}

/// Opens network channels to a server. One connector serves a whole
/// session, including its port-walking logon attempts.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<StreamPair>;

    fn open_packet_channel(&self, host: &str, port: u16) -> io::Result<PacketPair>;
}
