//! # Tether Client
//! The client half of a tether session: a framed reliable channel with an
//! optional sequenced datagram side-channel, a local cache of proxied
//! distributed objects, and an invocation layer correlating service
//! requests with their responses. Applications drive everything through
//! the [`Client`] facade and hear about session life through
//! [`SessionObserver`]s.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod client;
mod connection;
mod delta_calculator;
mod dispatch;
mod dobj;
mod dobj_manager;
mod error;
mod invocation;
mod observer;
mod transport;

pub use client::Client;
pub use connection::{Communicator, CommunicatorHost, LogonConfig, MessageSender};
pub use delta_calculator::{DeltaCalculator, CLOCK_SYNC_PINGS};
pub use dispatch::{run_guarded, DispatchQueue, ImmediateDispatcher, Job, ThreadDispatcher};
pub use dobj::{DObject, EventListener, Subscriber};
pub use dobj_manager::ClientDObjectMgr;
pub use error::{ClientError, LogonError, ObjectAccessError};
pub use invocation::{
    DirectorHost, InvocationDirector, NotificationReceiver, ResponseListener, RECEIVERS_ATTR,
    RECEIVER_ADDED, RECEIVER_REMOVED,
};
pub use observer::{ObserverList, SessionNotice, SessionObserver};
pub use transport::{
    Connector, PacketPair, PacketReceive, PacketSend, SocketConnector, StreamPair,
};
