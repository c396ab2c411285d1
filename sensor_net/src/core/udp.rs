use crate::core::{Envelope, Membership, NodeId, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

const MAX_UDP_PAYLOAD: usize = 65507;

/// Sends each envelope as a single CBOR-encoded datagram.
///
/// UDP neither orders nor retransmits. Snapshots taken over this transport are only as consistent
/// as the network is FIFO.
pub struct UdpTransport {
  me: NodeId,
  udp: Arc<UdpSocket>,
  directory: HashMap<NodeId, SocketAddr>,
}
impl UdpTransport {
  /// Resolves every member's address, binds this node's own, and starts the receive loop. A
  /// failure here is the one fatal error a node has.
  pub async fn bind(
    me: NodeId,
    membership: &Membership,
  ) -> std::io::Result<(UdpTransport, UnboundedReceiver<Envelope>)> {
    let mut directory = HashMap::new();
    for ident in membership.iter() {
      match ident.address.as_udp_addr().await?.into_iter().next() {
        Some(addr) => {
          directory.insert(ident.id, addr);
        }
        None => warn!(node = me, peer = ident.id, "no resolution for {}", ident.address),
      }
    }
    let own = directory.get(&me).copied().ok_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        format!("node {} has no address in the membership", me),
      )
    })?;
    let udp = Arc::new(UdpSocket::bind(own).await?);
    let (tx, rx) = unbounded_channel();
    tokio::spawn(udp_receiver(me, udp.clone(), tx));
    let transport = UdpTransport {
      me: me,
      udp: udp,
      directory: directory,
    };
    Ok((transport, rx))
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.udp.local_addr()
  }
}
#[async_trait]
impl Transport for UdpTransport {
  async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
    let addr = self.directory.get(&to).ok_or(TransportError::UnknownPeer(to))?;
    let bytes = serde_cbor::to_vec(&envelope)?;
    if bytes.len() > MAX_UDP_PAYLOAD {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("envelope of {} bytes does not fit a datagram", bytes.len()),
      )));
    }
    self.udp.send_to(&bytes[..], addr).await?;
    trace!(node = self.me, to = to, kind = envelope.msg.kind(), "sent datagram");
    Ok(())
  }
}

async fn udp_receiver(me: NodeId, udp: Arc<UdpSocket>, inbox: UnboundedSender<Envelope>) {
  let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
  loop {
    let (len, from) = match udp.recv_from(&mut buf[..]).await {
      Ok(x) => x,
      Err(e) => {
        warn!(node = me, error = %e, "datagram receive failed");
        continue;
      }
    };
    match serde_cbor::from_slice::<Envelope>(&buf[..len]) {
      Ok(envelope) => {
        if inbox.send(envelope).is_err() {
          trace!(node = me, "inbox closed, stopping udp receiver");
          return;
        }
      }
      Err(e) => warn!(node = me, %from, error = %e, "dropping undecodable datagram"),
    }
  }
}
