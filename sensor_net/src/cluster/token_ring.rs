use crate::cluster::NodeEvent;
use crate::core::{Message, NodeId, Outbox};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
  #[error("node {0} does not hold the token")]
  NotHolder(NodeId),
}

/// Mutual exclusion by a single token circulating along the sorted, static ring.
///
/// The ring never changes after construction. If the holder crashes before passing, the token is
/// gone and nobody will hold it again; there is no regeneration.
pub struct TokenRing {
  me: NodeId,
  ring: Vec<NodeId>,
  has_token: bool,
  uses: u64,
}
impl TokenRing {
  /// `members` is the whole ring, this node included.
  pub fn new(me: NodeId, members: Vec<NodeId>, has_token: bool) -> TokenRing {
    let mut ring = members;
    ring.push(me);
    ring.sort_unstable();
    ring.dedup();
    TokenRing {
      me: me,
      ring: ring,
      has_token: has_token,
      uses: 0,
    }
  }

  pub fn has_token(&self) -> bool {
    self.has_token
  }

  /// How many critical actions this node has performed.
  pub fn uses(&self) -> u64 {
    self.uses
  }

  /// This node's successor on the ring.
  pub fn next(&self) -> NodeId {
    match self.ring.binary_search(&self.me) {
      Ok(idx) => self.ring[(idx + 1) % self.ring.len()],
      // new() always inserts `me`
      Err(_) => self.me,
    }
  }

  pub fn on_token_received(&mut self, from: NodeId, fx: &mut Outbox) {
    if self.has_token {
      warn!(node = self.me, from, "received a second token");
    }
    debug!(node = self.me, from, "token received");
    self.has_token = true;
    fx.event(NodeEvent::TokenReceived { from: from });
  }

  /// Runs `action` exactly once under the token, then passes it on. Nothing runs when the token
  /// is elsewhere.
  pub fn use_token_then_pass<T, F>(&mut self, action: F, fx: &mut Outbox) -> Result<T, RingError>
  where
    F: FnOnce(&mut Outbox) -> T,
  {
    if !self.has_token {
      return Err(RingError::NotHolder(self.me));
    }
    let out = action(&mut *fx);
    self.uses += 1;
    self.pass(fx)?;
    Ok(out)
  }

  /// Hands the token to the successor. With no other member the token stays here.
  pub fn pass(&mut self, fx: &mut Outbox) -> Result<NodeId, RingError> {
    if !self.has_token {
      return Err(RingError::NotHolder(self.me));
    }
    let next = self.next();
    if next != self.me {
      self.has_token = false;
      fx.send(next, Message::Token);
      fx.event(NodeEvent::TokenPassed { to: next });
      debug!(node = self.me, to = next, "token passed");
    }
    Ok(next)
  }
}
