//! Standard-library TCP/UDP transport.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::debug;

use super::{Connector, PacketPair, PacketReceive, PacketSend, StreamPair};

/// How long a datagram receive blocks before surfacing a timeout, so the
/// reader loop can observe shutdown.
const PACKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// The production connector: a TCP stream for the reliable channel and a
/// connected UDP socket for the datagram channel.
pub struct SocketConnector;

impl Connector for SocketConnector {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<StreamPair> {
        let addr = resolve(host, port)?;
        debug!("Connecting [addr={addr}].");
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;

        let reader = stream.try_clone()?;
        let closer_stream = stream.try_clone()?;
        Ok(StreamPair {
            reader: Box::new(reader),
            writer: Box::new(stream),
            closer: Box::new(move || {
                // Repeated shutdowns after close report NotConnected;
                // that is the already-closed case, not a failure.
                let _ = closer_stream.shutdown(Shutdown::Both);
            }),
        })
    }

    fn open_packet_channel(&self, host: &str, port: u16) -> io::Result<PacketPair> {
        let addr = resolve(host, port)?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        socket.set_read_timeout(Some(PACKET_READ_TIMEOUT))?;
        let receiver = socket.try_clone()?;
        Ok(PacketPair {
            sender: Box::new(UdpHalf { socket }),
            receiver: Box::new(UdpHalf { socket: receiver }),
        })
    }
}

struct UdpHalf {
    socket: UdpSocket,
}

impl PacketSend for UdpHalf {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send(payload).map(|_| ())
    }
}

impl PacketReceive for UdpHalf {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

fn resolve(host: &str, port: u16) -> io::Result<std::net::SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
}
