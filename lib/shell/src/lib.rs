//! Remote Shell (spec.md §4.1): long-lived SSH sessions keyed by server
//! address, with blocking `run`, retrying `keep_try_run`, Docker-exec
//! helpers, and byte-copy into a running container.
//!
//! Grounded on the SSH session/channel pattern the pack's
//! `hydro_deploy` crate uses in `ssh_client.rs` (`russh::client::Handle`
//! + channel exec), simplified to the blocking request/response shape
//! this spec needs instead of hydro_deploy's streaming-process model.

mod session;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use genesis_build_state::{GenesisError, GenesisErrorKind};
use genesis_fleet::{ContainerName, NodeRef, SshTarget};
use tracing::{instrument, warn};

pub use session::ShellSession;

/// Exit codes that `keep_try_run` treats as transient (a fresh retry is
/// worth attempting) rather than permanent. The original Go genesis
/// client retries on network blips and a handful of Docker daemon exit
/// codes; this is the Rust rendering of that allow-list.
const RETRYABLE_EXIT_CODES: &[i32] = &[124, 125, 255];

/// Bounded exponential backoff schedule for `keep_try_run`.
const MAX_ATTEMPTS: usize = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(250);

/// Pool of SSH sessions, one per server address, leased exclusively for
/// the duration of one command (spec.md §3 ownership rule).
#[derive(Default)]
pub struct ShellPool {
  sessions: DashMap<String, Arc<ShellSession>>,
}

impl ShellPool {
  pub fn new() -> Self {
    ShellPool::default()
  }

  /// Returns the pooled session for `target`, opening a new SSH
  /// connection on first use.
  #[instrument(skip(self, target), fields(host = %target.host))]
  pub async fn get_or_connect(
    &self,
    target: &SshTarget,
  ) -> Result<Arc<ShellSession>, GenesisError> {
    let key = target.address();
    if let Some(existing) = self.sessions.get(&key) {
      if existing.is_alive().await {
        return Ok(existing.clone());
      }
    }
    let session = Arc::new(ShellSession::connect(target).await?);
    self.sessions.insert(key, session.clone());
    Ok(session)
  }

  pub fn remove(&self, target: &SshTarget) {
    self.sessions.remove(&target.address());
  }
}

/// One command's result: combined stdout and the process exit code.
#[derive(Debug, Clone)]
pub struct CommandOutput {
  pub stdout: String,
  pub exit_code: i32,
}

fn last_n_chars(s: &str, n: usize) -> String {
  let total = s.chars().count();
  if total <= n {
    return s.to_string();
  }
  s.chars().skip(total - n).collect()
}

impl ShellSession {
  /// Runs `cmd` to completion and fails with a `Permanent`
  /// (non-retryable exit code) or `Transient` [`GenesisError`] on
  /// non-zero exit, carrying the combined stderr tail.
  #[instrument(skip(self, cmd))]
  pub async fn run(&self, cmd: &str) -> Result<CommandOutput, GenesisError> {
    if self.cancelled() {
      return Err(GenesisError::cancelled());
    }
    let (stdout, stderr, exit_code) = self.exec_blocking(cmd).await?;
    if exit_code != 0 {
      let kind = if RETRYABLE_EXIT_CODES.contains(&exit_code) {
        GenesisErrorKind::Transient
      } else {
        GenesisErrorKind::Permanent
      };
      let tail = last_n_chars(&stderr, 2000);
      return Err(GenesisError::new(
        kind,
        format!("command exited {exit_code}: {tail}"),
      ));
    }
    Ok(CommandOutput { stdout, exit_code })
  }

  /// Retries [`ShellSession::run`] on transient failures with bounded
  /// exponential backoff, returning the last error once attempts are
  /// exhausted.
  #[instrument(skip(self, cmd))]
  pub async fn keep_try_run(&self, cmd: &str) -> Result<String, GenesisError> {
    let mut backoff = BASE_BACKOFF;
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
      if self.cancelled() {
        return Err(GenesisError::cancelled());
      }
      match self.run(cmd).await {
        Ok(output) => return Ok(output.stdout),
        Err(e) if e.kind == GenesisErrorKind::Transient => {
          warn!(attempt, "transient shell failure, retrying: {}", e.message);
          last_err = Some(e);
          tokio::time::sleep(backoff).await;
          backoff *= 2;
        }
        Err(e) => return Err(e),
      }
    }
    Err(last_err.unwrap_or_else(|| {
      GenesisError::transient("exhausted retry attempts")
    }))
  }

  /// `docker exec <container_name(node)> <cmd>`.
  pub async fn docker_exec(
    &self,
    prefix: &str,
    node: NodeRef,
    cmd: &str,
  ) -> Result<CommandOutput, GenesisError> {
    let name = ContainerName::for_node(prefix, &node);
    self.run(&format!("docker exec {name} {cmd}")).await
  }

  /// Detached variant (`-d`): returns as soon as the daemon accepts the
  /// exec, not when it finishes.
  pub async fn docker_execd(
    &self,
    prefix: &str,
    node: NodeRef,
    cmd: &str,
  ) -> Result<(), GenesisError> {
    let name = ContainerName::for_node(prefix, &node);
    self.run(&format!("docker exec -d {name} {cmd}")).await?;
    Ok(())
  }

  /// Detached, with stdout/stderr tee'd into a per-node log file inside
  /// the container.
  pub async fn docker_execd_log(
    &self,
    prefix: &str,
    node: NodeRef,
    cmd: &str,
    log_path: &str,
  ) -> Result<(), GenesisError> {
    let name = ContainerName::for_node(prefix, &node);
    let command = format!(
      "docker exec -d {name} bash -c '{cmd} > {log_path} 2>&1'"
    );
    self.run(&command).await?;
    Ok(())
  }

  /// Writes `bytes` to `path` inside the named container, creating
  /// parent directories first (spec.md §6 guarantee).
  #[instrument(skip(self, bytes))]
  pub async fn copy_bytes_to(
    &self,
    container: &ContainerName,
    path: &str,
    bytes: &[u8],
  ) -> Result<(), GenesisError> {
    if let Some(parent) = path.rsplit_once('/').map(|(dir, _)| dir) {
      if !parent.is_empty() {
        self
          .docker_mkdir_p(container, parent)
          .await?;
      }
    }
    self.sftp_write_into_container(container, path, bytes).await
  }

  async fn docker_mkdir_p(
    &self,
    container: &ContainerName,
    dir: &str,
  ) -> Result<(), GenesisError> {
    self
      .run(&format!("docker exec {container} mkdir -p {dir}"))
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn last_n_chars_truncates_from_the_front() {
    assert_eq!(last_n_chars("hello world", 5), "world");
    assert_eq!(last_n_chars("hi", 5), "hi");
  }

  #[test]
  fn retryable_exit_codes_are_treated_as_transient() {
    assert!(RETRYABLE_EXIT_CODES.contains(&124));
    assert!(!RETRYABLE_EXIT_CODES.contains(&1));
  }
}
