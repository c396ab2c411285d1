use crate::core::{Envelope, NodeId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("no address known for node {0}")]
  UnknownPeer(NodeId),
  #[error("inbox of node {0} is closed")]
  Closed(NodeId),
  #[error("could not encode envelope: {0}")]
  Encode(#[from] serde_cbor::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// The outbound half of a node's network. Inbound envelopes arrive on the
/// `UnboundedReceiver<Envelope>` handed out next to each implementation.
///
/// Sends are best-effort: an `Err` means the envelope is known to be lost, an `Ok` promises
/// nothing more than that it left.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError>;
}
