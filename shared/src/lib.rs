//! # Tether Shared
//! Common functionality shared between the tether server & client crates:
//! wire serialization, session messages, distributed object events, stream
//! framing, sequenced datagrams and the shared outgoing throttle.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod backends;
mod connection;
mod dobj;
mod messages;
mod serdes;
mod transport;
mod types;
mod value;

pub use backends::{clock::millis_now, rand::session_key, timer::Timer};
pub use connection::{
    datagram::{DatagramCodec, DATAGRAM_CEILING, DATAGRAM_HEADER_SIZE},
    error::{DatagramError, FrameError},
    framing::{decode_downstream, decode_upstream, FrameReader, FrameWriter, MAX_FRAME_SIZE},
    sequencer::DatagramSequencer,
    throttle::OutgoingThrottle,
};
pub use dobj::{DEvent, DObjectSnapshot};
pub use messages::{
    auth::{auth_codes, AuthResponseData, Credentials},
    downstream::{DownstreamMessage, PongResponse},
    upstream::UpstreamMessage,
};
pub use serdes::{SerdesError, WireReader, WireWriter};
pub use transport::Transport;
pub use types::{ConnectionId, HostType, Oid, ReceiverId, RequestId};
pub use value::{de_values, ser_values, DValue};
