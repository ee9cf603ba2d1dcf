/// Identifier of a distributed object instance. Valid oids are strictly
/// positive; zero and negative values are rejected at the subscription seam.
pub type Oid = i32;

/// Correlation key for an outstanding invocation request. Wraps.
pub type RequestId = u16;

/// Correlation key for a registered notification receiver.
pub type ReceiverId = u16;

/// Identifier assigned to a session by the server at bootstrap time, echoed
/// in every datagram so the server can associate packets with the session.
pub type ConnectionId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Server,
    Client,
}

impl HostType {
    pub fn invert(self) -> Self {
        match self {
            HostType::Server => HostType::Client,
            HostType::Client => HostType::Server,
        }
    }
}
