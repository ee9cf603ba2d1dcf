pub mod datagram;
pub mod error;
pub mod framing;
pub mod sequencer;
pub mod throttle;
