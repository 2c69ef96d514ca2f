//! Container and network spec records (spec.md §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
  pub host_path: String,
  pub container_path: String,
  pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
  pub host_port: u16,
  pub container_port: u16,
  pub protocol: PortProtocol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
  Tcp,
  Udp,
}

impl PortProtocol {
  pub fn as_str(self) -> &'static str {
    match self {
      PortProtocol::Tcp => "tcp",
      PortProtocol::Udp => "udp",
    }
  }
}

/// Semantic record describing a container to create. Name is unique per
/// host (spec.md §3 Container Spec invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
  pub name: String,
  pub image: String,
  pub env: HashMap<String, String>,
  pub command: Vec<String>,
  pub mounts: Vec<Mount>,
  pub networks: Vec<String>,
  pub cpus: Option<f64>,
  pub memory_bytes: Option<u64>,
  pub ports: Vec<PortMapping>,
  pub entrypoint: Option<Vec<String>>,
  pub labels: HashMap<String, String>,
}

/// Subnets must be disjoint within a host (spec.md §3 Network Spec
/// invariant); enforcement lives in the Docker Service, which is the
/// only component that sees every network on a host at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
  pub name: String,
  pub subnet_cidr: String,
  pub gateway: String,
  pub driver: String,
  pub labels: HashMap<String, String>,
}
