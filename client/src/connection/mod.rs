//! The network side of a session: worker loops and the communicator state
//! machine that drives them.

pub mod communicator;
pub mod worker;

use tether_shared::{Transport, UpstreamMessage};

/// The outbound seam between the session services (object manager,
/// invocation director, facade) and the wire. The communicator is the
/// production implementation; tests substitute recording senders.
pub trait MessageSender: Send + Sync {
    /// Queues a message for delivery with the given transport hint. Never
    /// blocks the caller; actual rate limiting happens on the writer loops.
    fn send(&self, message: UpstreamMessage, transport: Transport);
}

pub use communicator::{Communicator, CommunicatorHost, LogonConfig};
