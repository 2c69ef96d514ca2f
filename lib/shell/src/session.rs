use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use genesis_build_state::{GenesisError, GenesisErrorKind};
use genesis_fleet::{ContainerName, SshTarget};
use russh::ChannelMsg;
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;

struct NoHostKeyCheck;

impl client::Handler for NoHostKeyCheck {
  type Error = russh::Error;

  // Genesis dials hosts it was just handed by the fleet's own inventory
  // (not discovered over the network), so there is no separate
  // known-hosts channel to check the fingerprint against.
  async fn check_server_key(
    &mut self,
    _server_public_key: &russh::keys::ssh_key::PublicKey,
  ) -> Result<bool, Self::Error> {
    Ok(true)
  }
}

/// One SSH connection to a server, leased exclusively for the duration
/// of a command (spec.md §3): the handle is wrapped in a mutex so two
/// callers can never interleave channel exec on the same connection.
pub struct ShellSession {
  handle: Mutex<Handle<NoHostKeyCheck>>,
  cancelled: AtomicBool,
}

impl ShellSession {
  pub async fn connect(target: &SshTarget) -> Result<Self, GenesisError> {
    let config = Arc::new(client::Config::default());
    let key_pair = load_secret_key(&target.key_path, None).map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Config,
        format!("failed to load SSH key at {:?}", target.key_path),
        e.into(),
      )
    })?;

    let addr = (target.host.as_str(), target.port);
    let mut session =
      client::connect(config, addr, NoHostKeyCheck)
        .await
        .map_err(|e| {
          GenesisError::with_source(
            GenesisErrorKind::Transient,
            format!("failed to connect to {}:{}", target.host, target.port),
            e.into(),
          )
        })?;

    let hash_alg = session
      .best_supported_rsa_hash()
      .await
      .map_err(|e| {
        GenesisError::with_source(
          GenesisErrorKind::Permanent,
          "failed to negotiate SSH key hash algorithm",
          e.into(),
        )
      })?
      .flatten();

    let auth = session
      .authenticate_publickey(
        &target.user,
        PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
      )
      .await
      .map_err(|e| {
        GenesisError::with_source(
          GenesisErrorKind::Permanent,
          "SSH authentication failed",
          e.into(),
        )
      })?;

    if !auth.success() {
      return Err(GenesisError::permanent(format!(
        "SSH authentication rejected for {}",
        target.address()
      )));
    }

    Ok(ShellSession {
      handle: Mutex::new(session),
      cancelled: AtomicBool::new(false),
    })
  }

  pub async fn is_alive(&self) -> bool {
    !self.cancelled.load(Ordering::Relaxed)
  }

  pub(crate) fn cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Relaxed)
  }

  pub fn mark_dead(&self) {
    self.cancelled.store(true, Ordering::Relaxed);
  }

  /// Opens a channel, execs `cmd`, and collects stdout/stderr/exit code.
  /// Holds the session's lock for the duration, implementing the
  /// "leased exclusively for one command" ownership rule.
  pub(crate) async fn exec_blocking(
    &self,
    cmd: &str,
  ) -> Result<(String, String, i32), GenesisError> {
    let handle = self.handle.lock().await;
    let mut channel = handle.channel_open_session().await.map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Transient,
        "failed to open SSH channel",
        e.into(),
      )
    })?;
    channel.exec(true, cmd).await.map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Transient,
        "failed to exec over SSH channel",
        e.into(),
      )
    })?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit_code = 0i32;

    loop {
      let Some(msg) = channel.wait().await else { break };
      match msg {
        ChannelMsg::Data { data } => {
          stdout.push_str(&String::from_utf8_lossy(&data));
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
          stderr.push_str(&String::from_utf8_lossy(&data));
        }
        ChannelMsg::ExtendedData { .. } => {}
        ChannelMsg::ExitStatus { exit_status } => {
          exit_code = exit_status as i32;
        }
        ChannelMsg::Eof | ChannelMsg::Close => break,
        _ => {}
      }
    }

    Ok((stdout, stderr, exit_code))
  }

  pub(crate) async fn sftp_write_into_container(
    &self,
    container: &ContainerName,
    path: &str,
    bytes: &[u8],
  ) -> Result<(), GenesisError> {
    // Genesis doesn't SFTP into the container directly (containers
    // rarely run an sftp-server); it SFTPs the bytes to a staging path
    // on the host, then has the host's Docker CLI `cp` them in.
    let handle = self.handle.lock().await;
    let channel = handle.channel_open_session().await.map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Transient,
        "failed to open SFTP channel",
        e.into(),
      )
    })?;
    channel.request_subsystem(true, "sftp").await.map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Transient,
        "failed to request sftp subsystem",
        e.into(),
      )
    })?;
    let sftp = SftpSession::new(channel.into_stream()).await.map_err(|e| {
      GenesisError::with_source(
        GenesisErrorKind::Transient,
        "failed to start sftp session",
        e.into(),
      )
    })?;
    drop(handle);

    let staging_path =
      format!("/tmp/genesis-stage-{}", uuid_like_suffix(path));
    {
      use tokio::io::AsyncWriteExt;
      let mut file = sftp.create(&staging_path).await.map_err(|e| {
        GenesisError::with_source(
          GenesisErrorKind::Transient,
          format!("failed to create staging file {staging_path}"),
          e.into(),
        )
      })?;
      file.write_all(bytes).await.map_err(|e| {
        GenesisError::with_source(
          GenesisErrorKind::Transient,
          "failed to write staged bytes over sftp",
          e.into(),
        )
      })?;
    }

    self
      .run(&format!(
        "docker cp {staging_path} {container}:{path} && rm -f {staging_path}"
      ))
      .await?;
    Ok(())
  }
}

/// Filesystem-safe suffix for a staging path, unique enough to avoid
/// collisions between concurrently-staged paths on the same host.
fn uuid_like_suffix(path: &str) -> String {
  use std::collections::hash_map::DefaultHasher;
  use std::hash::{Hash, Hasher};
  use std::sync::atomic::{AtomicU64, Ordering};

  static COUNTER: AtomicU64 = AtomicU64::new(0);

  let mut hasher = DefaultHasher::new();
  path.hash(&mut hasher);
  COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
  format!("{:x}", hasher.finish())
}
