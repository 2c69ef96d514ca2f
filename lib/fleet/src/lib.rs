//! Fleet data model: deployments, servers, and the nodes living on them.
//!
//! A [`Fleet`] owns an ordered set of [`ServerHandle`]s; each server owns an
//! ordered set of local nodes. [`NodeRef`] carries the three identifiers a
//! node is addressed by: its server index, its local number, and its
//! absolute number (row-major position across the whole fleet). The mapping
//! `(server_index, local_number) <-> absolute_number` is a bijection and is
//! stable for the deployment's lifetime.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod spec;

pub use spec::{ContainerSpec, Mount, NetworkSpec, PortMapping};

/// Parameters needed to open a Remote Shell session to a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTarget {
  pub host: String,
  pub port: u16,
  pub user: String,
  pub key_path: PathBuf,
}

impl SshTarget {
  pub fn address(&self) -> String {
    format!("{}@{}:{}", self.user, self.host, self.port)
  }
}

/// One remote Docker host participating in a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandle {
  /// Position of this server in the fleet. Set by [`Fleet::new`], not by
  /// the caller, so it always matches the server's index in `servers`.
  pub index: usize,
  pub ssh: SshTarget,
  /// IP pool this server draws node addresses from, indexed by
  /// local node number.
  pub ip_pool: Vec<IpAddr>,
}

/// Address of a single node: where it lives and how to name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
  pub server_index: usize,
  pub local_number: usize,
  pub absolute_number: usize,
  pub ip: IpAddr,
}

/// The set of servers participating in one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Fleet {
  servers: Vec<ServerHandle>,
  /// Local node count per server, indexed by server index. Declared
  /// separately from `servers` because a server's IP pool may be larger
  /// than its current node count (room to grow without reshuffling).
  node_counts: Vec<usize>,
}

impl Fleet {
  /// Builds a fleet from servers and the per-server node counts,
  /// assigning stable server indices by position.
  pub fn new(
    mut servers: Vec<ServerHandle>,
    node_counts: Vec<usize>,
  ) -> Self {
    assert_eq!(
      servers.len(),
      node_counts.len(),
      "one node count per server is required"
    );
    for (i, server) in servers.iter_mut().enumerate() {
      server.index = i;
    }
    Fleet { servers, node_counts }
  }

  pub fn servers(&self) -> &[ServerHandle] {
    &self.servers
  }

  pub fn server(&self, index: usize) -> Option<&ServerHandle> {
    self.servers.get(index)
  }

  pub fn node_count(&self) -> usize {
    self.node_counts.iter().sum()
  }

  /// Row-major traversal of the fleet: server 0's nodes, then server 1's,
  /// and so on. This is the definition of absolute numbering.
  pub fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
    self.servers.iter().zip(&self.node_counts).scan(
      0usize,
      |absolute, (server, &count)| {
        let start = *absolute;
        *absolute += count;
        Some((server, start, count))
      },
    ).flat_map(|(server, start, count)| {
      (0..count).map(move |local_number| NodeRef {
        server_index: server.index,
        local_number,
        absolute_number: start + local_number,
        ip: server.ip_pool[local_number],
      })
    })
  }

  /// Nodes belonging to a single server, still carrying their absolute
  /// numbers.
  pub fn nodes_on(&self, server_index: usize) -> Vec<NodeRef> {
    self
      .nodes()
      .filter(|n| n.server_index == server_index)
      .collect()
  }
}

/// `container_name(node) = NODE_PREFIX + absolute_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerName(pub String);

impl ContainerName {
  pub fn for_node(prefix: &str, node: &NodeRef) -> Self {
    ContainerName(format!("{prefix}{}", node.absolute_number))
  }
}

impl std::fmt::Display for ContainerName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn server(index: usize, ips: usize) -> ServerHandle {
    ServerHandle {
      index,
      ssh: SshTarget {
        host: format!("host{index}"),
        port: 22,
        user: "root".into(),
        key_path: "/dev/null".into(),
      },
      ip_pool: (0..ips)
        .map(|i| IpAddr::from([10, 0, index as u8, i as u8]))
        .collect(),
    }
  }

  #[test]
  fn absolute_numbering_is_row_major_and_dense() {
    let fleet =
      Fleet::new(vec![server(0, 3), server(1, 3)], vec![2, 2]);
    let absolutes: Vec<_> =
      fleet.nodes().map(|n| n.absolute_number).collect();
    assert_eq!(absolutes, vec![0, 1, 2, 3]);
  }

  #[test]
  fn server_and_local_numbers_round_trip_to_absolute() {
    let fleet =
      Fleet::new(vec![server(0, 2), server(1, 2)], vec![2, 2]);
    for node in fleet.nodes() {
      let on_server = fleet.nodes_on(node.server_index);
      assert_eq!(
        on_server[node.local_number].absolute_number,
        node.absolute_number
      );
    }
  }

  #[test]
  fn container_name_uses_prefix_and_absolute_number() {
    let node = NodeRef {
      server_index: 1,
      local_number: 0,
      absolute_number: 5,
      ip: IpAddr::from([10, 0, 0, 1]),
    };
    assert_eq!(
      ContainerName::for_node("genesis-", &node).0,
      "genesis-5"
    );
  }
}
