//! Docker Auxiliary (spec.md §4.2) and Docker Service (spec.md §4.3).
//!
//! Grounded on Komodo's periphery Docker resolvers
//! (`bin/periphery/src/api/docker.rs`): read-only "by name" queries, a
//! single-flight image-pull lock, and mutation methods that return a
//! `Log`-shaped result. Komodo's periphery runs colocated with its one
//! local daemon; Genesis orchestrates *remote* hosts, so the pool here
//! is keyed by server address instead of being a single process-wide
//! `OnceLock` client.

pub mod aux;
pub mod endpoint;
pub mod service;

pub use aux::DockerAux;
pub use endpoint::{DockerEndpoint, DockerHostPool};
pub use service::DockerService;
