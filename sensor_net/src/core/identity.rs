use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::lookup_host;

/// Globally unique, totally ordered node identifier. Higher ids win elections.
pub type NodeId = u64;

/// The DNS name or IP address of the machine hosting a node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}

/// The remote address a node receives datagrams on.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
pub struct Socket {
  pub host: Host,
  pub udp: u16,
}
impl Socket {
  pub fn new(host: Host, udp: u16) -> Socket {
    Socket {
      host: host,
      udp: udp,
    }
  }

  pub fn localhost(udp: u16) -> Socket {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)), udp)
  }

  /// Uses the UDP port of this [`Socket`] in a raw [`SocketAddr`]. If the [`Host`] is a DNS
  /// name, this performs a lookup and keeps IPv4 results only.
  pub async fn as_udp_addr(&self) -> std::io::Result<Vec<SocketAddr>> {
    match &self.host {
      Host::IP(ip) => Ok(vec![SocketAddr::new(*ip, self.udp)]),
      Host::DNS(s) => lookup_host((s.as_str(), self.udp))
        .await
        .map(|x| x.filter(|a| a.is_ipv4()).collect()),
    }
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.host {
      Host::DNS(s) => write!(f, "{}:{}", s, self.udp),
      Host::IP(ip) => write!(f, "{}:{}", ip, self.udp),
    }
  }
}
impl Default for Socket {
  fn default() -> Self {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), 0)
  }
}

/// Who a node is. Created at startup and never mutated.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct NodeIdentity {
  pub id: NodeId,
  pub address: Socket,
  /// Index of this node in the id-sorted ring.
  pub ring_position: usize,
}

/// The static ring: every node of the cluster, sorted by id.
///
/// Membership is fixed once built. Nodes that crash stay in it; liveness is the failure
/// detector's business, not the ring's.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawMembership")]
pub struct Membership {
  members: Vec<NodeIdentity>,
}
// Whatever order and positions a file claims, the ring is rebuilt from ids.
#[derive(Deserialize)]
struct RawMembership {
  members: Vec<NodeIdentity>,
}
impl From<RawMembership> for Membership {
  fn from(raw: RawMembership) -> Self {
    Membership::new(raw.members.into_iter().map(|m| (m.id, m.address)))
  }
}
impl Membership {
  /// Sorts by id and assigns ring positions. Duplicate ids keep the first address given.
  pub fn new<I: IntoIterator<Item = (NodeId, Socket)>>(nodes: I) -> Membership {
    let members = nodes
      .into_iter()
      .sorted_by_key(|(id, _)| *id)
      .unique_by(|(id, _)| *id)
      .enumerate()
      .map(|(pos, (id, address))| NodeIdentity {
        id: id,
        address: address,
        ring_position: pos,
      })
      .collect();
    Membership { members: members }
  }

  /// A membership for in-process clusters, where addresses are never dialled.
  pub fn local<I: IntoIterator<Item = NodeId>>(ids: I) -> Membership {
    Membership::new(ids.into_iter().map(|id| (id, Socket::default())))
  }

  pub fn ids(&self) -> Vec<NodeId> {
    self.members.iter().map(|m| m.id).collect()
  }

  /// Every member except `id`, in ring order.
  pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
    self.members.iter().map(|m| m.id).filter(|x| *x != id).collect()
  }

  pub fn identity(&self, id: NodeId) -> Option<&NodeIdentity> {
    self
      .members
      .binary_search_by_key(&id, |m| m.id)
      .ok()
      .map(|idx| &self.members[idx])
  }

  pub fn contains(&self, id: NodeId) -> bool {
    self.identity(id).is_some()
  }

  pub fn lowest(&self) -> Option<NodeId> {
    self.members.first().map(|m| m.id)
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &NodeIdentity> {
    self.members.iter()
  }
}

#[test]
fn test_membership_order() {
  let membership = Membership::new(vec![
    (30, Socket::localhost(6003)),
    (10, Socket::localhost(6001)),
    (20, Socket::localhost(6002)),
    (10, Socket::localhost(7001)),
  ]);
  assert_eq!(membership.ids(), vec![10, 20, 30]);
  assert_eq!(membership.peers_of(20), vec![10, 30]);
  let ident = membership.identity(30).unwrap();
  assert_eq!(ident.ring_position, 2);
  assert_eq!(ident.address.udp, 6003);
  assert_eq!(membership.identity(10).unwrap().address.udp, 6001);
  assert!(membership.identity(40).is_none());
  assert_eq!(membership.lowest(), Some(10));
}
