//! Base pieces every protocol builds on: the Lamport clock, node identities and the static ring
//! membership, the wire [`Message`] and its [`Envelope`], and the [`Transport`] seam nodes send
//! through.
//!
//! ### Clocks
//! Every envelope carries its sender's clock at send time. A node ticks its [`LamportClock`] once
//! per outbound envelope and folds the carried value in with
//! [`update`](LamportClock::update) on receipt, so for any message sent at `Ts` the receiver's
//! clock afterwards is greater than `Ts`.
//!
//! ### Transports
//! A [`Transport`] only sends. Whoever builds one also hands the node an
//! `UnboundedReceiver<Envelope>` for its inbox. [`UdpTransport`] is the real network;
//! [`MemoryNetwork`](crate::testkit::MemoryNetwork) is the in-process one used by tests and the
//! simulation.

mod clock;
mod identity;
mod message;
mod transport;
mod udp;

#[rustfmt::skip]
pub use {
  clock::LamportClock,
  clock::SharedClock,
  identity::Host,
  identity::Membership,
  identity::NodeId,
  identity::NodeIdentity,
  identity::Socket,
  message::Envelope,
  message::Message,
  message::Outbox,
  message::SnapshotId,
  transport::Transport,
  transport::TransportError,
  udp::UdpTransport,
};
