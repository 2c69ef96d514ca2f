//! BuildState (spec.md §3, §4.4): the per-deployment progress counter,
//! scratch store, deferred-cleanup stack, error latch, and cancellation
//! flag. Exposed as message-passing methods on `&self` so workers never
//! touch the shared state directly (spec.md §9 design note) — internally
//! it is still a mutex-guarded record, as the design note allows.

pub mod command;
pub mod error;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use command::{Command, CompletionEnvelope, StatusEnvelope, parse_command};
pub use error::{ErrorEnvelope, GenesisError, GenesisErrorKind};

type DeferredCleanup = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Inner {
  total_steps: u64,
  completed_steps: u64,
  stage: String,
  scratch: HashMap<String, Bytes>,
  ext: HashMap<String, Value>,
  deferred: Vec<DeferredCleanup>,
  error: Option<GenesisError>,
  done: bool,
}

impl Default for Inner {
  fn default() -> Self {
    Inner {
      total_steps: 0,
      completed_steps: 0,
      stage: String::new(),
      scratch: HashMap::new(),
      ext: HashMap::new(),
      deferred: Vec::new(),
      error: None,
      done: false,
    }
  }
}

/// Per-deployment handle, cheap to clone and share across fan-out
/// workers (spec.md §3 ownership: exclusively owned by the Command
/// Controller that created it, shared internally via a mutex).
#[derive(Clone)]
pub struct BuildState {
  inner: Arc<Mutex<Inner>>,
  cancel: CancellationToken,
}

impl Default for BuildState {
  fn default() -> Self {
    Self::new()
  }
}

impl BuildState {
  pub fn new() -> Self {
    BuildState {
      inner: Arc::new(Mutex::new(Inner::default())),
      cancel: CancellationToken::new(),
    }
  }

  /// P1: total_steps is set once per build phase; completed_steps is
  /// clamped to it so progress can never exceed total.
  pub async fn set_build_steps(&self, n: u64) {
    let mut inner = self.inner.lock().await;
    inner.total_steps = n;
  }

  /// Atomic with respect to other progress mutations (spec.md §5):
  /// completed_steps never exceeds total_steps (P1).
  pub async fn increment_build_progress(&self) {
    let mut inner = self.inner.lock().await;
    if inner.completed_steps < inner.total_steps {
      inner.completed_steps += 1;
    }
  }

  pub async fn progress(&self) -> (u64, u64) {
    let inner = self.inner.lock().await;
    (inner.completed_steps, inner.total_steps)
  }

  pub async fn set_build_stage(&self, stage: impl Into<String>) {
    let mut inner = self.inner.lock().await;
    inner.stage = stage.into();
  }

  pub async fn stage(&self) -> String {
    self.inner.lock().await.stage.clone()
  }

  pub async fn status_envelope(&self, id: impl Into<String>) -> StatusEnvelope {
    let inner = self.inner.lock().await;
    StatusEnvelope {
      id: id.into(),
      completed_steps: inner.completed_steps,
      total_steps: inner.total_steps,
      stage: inner.stage.clone(),
    }
  }

  /// Stage an artifact (genesis file, passwd file, static-nodes list)
  /// before it is copied out to hosts.
  pub async fn write(&self, key: impl Into<String>, bytes: impl Into<Bytes>) {
    let mut inner = self.inner.lock().await;
    inner.scratch.insert(key.into(), bytes.into());
  }

  pub async fn read(&self, key: &str) -> Option<Bytes> {
    self.inner.lock().await.scratch.get(key).cloned()
  }

  pub async fn set_ext(&self, key: impl Into<String>, value: Value) {
    let mut inner = self.inner.lock().await;
    inner.ext.insert(key.into(), value);
  }

  pub async fn get_ext(&self, key: &str) -> Option<Value> {
    self.inner.lock().await.ext.get(key).cloned()
  }

  pub async fn ext_snapshot(&self) -> Value {
    let inner = self.inner.lock().await;
    Value::Object(inner.ext.clone().into_iter().collect())
  }

  /// Pushes a cleanup future onto the LIFO deferred stack. The deferred
  /// stack is append-only during the build phase (spec.md §5); it is
  /// only drained by [`BuildState::finish`].
  pub async fn defer(
    &self,
    cleanup: impl Future<Output = ()> + Send + 'static,
  ) {
    let mut inner = self.inner.lock().await;
    inner.deferred.push(Box::pin(cleanup));
  }

  /// P3: runs deferred closures in LIFO order. Inner failures are
  /// logged, never latched — unwind must always complete so terminal
  /// status can be published (spec.md §4.4, §7).
  async fn unwind(&self) {
    let deferred = {
      let mut inner = self.inner.lock().await;
      std::mem::take(&mut inner.deferred)
    };
    for cleanup in deferred.into_iter().rev() {
      cleanup.await;
    }
  }

  /// P2: latches the first non-nil error; subsequent reports are
  /// discarded but logged.
  pub async fn report(&self, err: GenesisError) {
    let mut inner = self.inner.lock().await;
    if inner.error.is_some() {
      warn!(
        "BuildState already has a latched error, discarding: {}",
        err.message
      );
      return;
    }
    inner.error = Some(err);
  }

  pub async fn error(&self) -> Option<Arc<GenesisError>> {
    // Cloned out from behind the lock rather than returned by
    // reference, since GenesisError doesn't implement Clone (it wraps
    // an opaque anyhow source); callers needing the message/kind use
    // the cheap accessors below.
    let inner = self.inner.lock().await;
    inner.error.as_ref().map(|e| {
      Arc::new(GenesisError::new(e.kind, e.message.clone()))
    })
  }

  pub async fn failed(&self) -> bool {
    self.inner.lock().await.error.is_some()
  }

  /// Runs `unwind()` then marks the build terminal. Idempotent: calling
  /// twice only unwinds once (the stack is empty on the second call).
  pub async fn finish(&self) {
    self.unwind().await;
    let mut inner = self.inner.lock().await;
    inner.done = true;
  }

  pub async fn is_done(&self) -> bool {
    self.inner.lock().await.done
  }

  /// Sets the sticky cancellation flag. Long-running operations observe
  /// this at the suspension points documented in spec.md §5.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn progress_is_monotonic_and_bounded() {
    let state = BuildState::new();
    state.set_build_steps(3).await;
    for _ in 0..5 {
      state.increment_build_progress().await;
    }
    let (completed, total) = state.progress().await;
    assert_eq!(total, 3);
    assert_eq!(completed, 3, "progress must never exceed total");
  }

  #[tokio::test]
  async fn error_latches_first_value() {
    let state = BuildState::new();
    state.report(GenesisError::permanent("first")).await;
    state.report(GenesisError::transient("second")).await;
    let err = state.error().await.unwrap();
    assert_eq!(err.message, "first");
  }

  #[tokio::test]
  async fn unwind_runs_lifo() {
    let state = BuildState::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for label in ["a", "b", "c"] {
      let order = order.clone();
      state
        .defer(async move { order.lock().await.push(label) })
        .await;
    }
    state.finish().await;
    assert_eq!(*order.lock().await, vec!["c", "b", "a"]);
  }

  #[tokio::test]
  async fn finish_is_idempotent() {
    let state = BuildState::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    state
      .defer(async move {
        calls2.fetch_add(1, Ordering::SeqCst);
      })
      .await;
    state.finish().await;
    state.finish().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(state.is_done().await);
  }

  #[tokio::test]
  async fn cancellation_is_sticky() {
    let state = BuildState::new();
    assert!(!state.is_cancelled());
    state.cancel();
    assert!(state.is_cancelled());
    state.cancel();
    assert!(state.is_cancelled());
  }
}
