//! Index lifecycle and readiness gate.
//!
//! Every backend moves through `Constructed -> Initialized -> Ready -> Stopped`.
//! Data operations are only served in `Ready`; callers that race startup block
//! in [`Lifecycle::wait_ready`] until the transition happens or their deadline
//! passes.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use vellum_core::{HealthCheck, IndexResult, LifecycleError};

/// Lifecycle state of an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    /// Created, nothing allocated or loaded yet
    Constructed,
    /// Internal structures allocated, persisted state loaded, schema validated
    Initialized,
    /// Serving requests
    Ready,
    /// Shut down; terminal
    Stopped,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexState::Constructed => "constructed",
            IndexState::Initialized => "initialized",
            IndexState::Ready => "ready",
            IndexState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle state shared by an index and its waiters.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<IndexState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(IndexState::Constructed);
        Self { state }
    }

    pub fn state(&self) -> IndexState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == IndexState::Ready
    }

    /// `Constructed -> Initialized`. Re-initializing is a no-op.
    pub fn mark_initialized(&self) -> IndexResult<()> {
        self.transition(&[IndexState::Constructed], IndexState::Initialized)
    }

    /// `Initialized -> Ready`. Re-starting is a no-op.
    pub fn mark_ready(&self) -> IndexResult<()> {
        self.transition(&[IndexState::Initialized], IndexState::Ready)
    }

    /// Any state `-> Stopped`.
    pub fn mark_stopped(&self) {
        self.state.send_replace(IndexState::Stopped);
    }

    fn transition(&self, from: &[IndexState], to: IndexState) -> IndexResult<()> {
        let mut rejected = None;
        let changed = self.state.send_if_modified(|current| {
            if *current == to {
                false
            } else if from.contains(current) {
                *current = to;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            None => {
                if changed {
                    tracing::info!(state = %to, "Artifact index lifecycle transition");
                }
                Ok(())
            }
            Some(IndexState::Stopped) => Err(LifecycleError::Stopped.into()),
            Some(current) => Err(LifecycleError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            }
            .into()),
        }
    }

    /// Fail with `NotReady` unless the index is serving.
    pub fn ensure_ready(&self) -> IndexResult<()> {
        match self.state() {
            IndexState::Ready => Ok(()),
            state => Err(LifecycleError::NotReady {
                state: state.to_string(),
            }
            .into()),
        }
    }

    /// Block until the index is ready, it is stopped, or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> IndexResult<()> {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| matches!(state, IndexState::Ready | IndexState::Stopped))
                .await
                .map(|state| *state)
        })
        .await;

        match reached {
            Ok(Ok(IndexState::Ready)) => Ok(()),
            Ok(_) => Err(LifecycleError::Stopped.into()),
            Err(_) => Err(LifecycleError::Timeout { waited: timeout }.into()),
        }
    }
}

/// Health of an index that is not serving: `Unknown` before it has been
/// started, `Unhealthy` once stopped.
pub(crate) fn idle_health(component: &str, state: IndexState) -> HealthCheck {
    match state {
        IndexState::Stopped => HealthCheck::unhealthy(component, "index is stopped"),
        state => HealthCheck::unknown(component, format!("index is {}", state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vellum_core::IndexError;

    #[test]
    fn test_happy_path_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), IndexState::Constructed);
        lifecycle.mark_initialized().expect("init");
        lifecycle.mark_initialized().expect("init is idempotent");
        lifecycle.mark_ready().expect("ready");
        lifecycle.mark_ready().expect("ready is idempotent");
        assert!(lifecycle.is_ready());
        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), IndexState::Stopped);
    }

    #[test]
    fn test_repeated_transition_is_silent() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_initialized().expect("init");
        lifecycle.mark_ready().expect("ready");

        let rx = lifecycle.state.subscribe();
        lifecycle.mark_initialized().expect_err("ready cannot go back");
        lifecycle.mark_ready().expect("ready is idempotent");
        assert!(!rx.has_changed().expect("sender alive"));
    }

    #[test]
    fn test_cannot_skip_initialization() {
        let lifecycle = Lifecycle::new();
        match lifecycle.mark_ready() {
            Err(IndexError::Lifecycle(LifecycleError::InvalidTransition { from, to })) => {
                assert_eq!(from, "constructed");
                assert_eq!(to, "ready");
            }
            other => panic!("expected invalid transition, got {:?}", other),
        }
    }

    #[test]
    fn test_stopped_is_terminal() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_stopped();
        assert!(matches!(
            lifecycle.mark_initialized(),
            Err(IndexError::Lifecycle(LifecycleError::Stopped))
        ));
    }

    #[test]
    fn test_ensure_ready_reports_state() {
        let lifecycle = Lifecycle::new();
        match lifecycle.ensure_ready() {
            Err(IndexError::Lifecycle(LifecycleError::NotReady { state })) => {
                assert_eq!(state, "constructed")
            }
            other => panic!("expected not ready, got {:?}", other),
        }
    }

    #[test]
    fn test_idle_health() {
        use vellum_core::HealthStatus;
        assert_eq!(idle_health("x", IndexState::Constructed).status, HealthStatus::Unknown);
        assert_eq!(idle_health("x", IndexState::Initialized).status, HealthStatus::Unknown);
        assert_eq!(idle_health("x", IndexState::Stopped).status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let lifecycle = Lifecycle::new();
        let result = lifecycle.wait_ready(Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(IndexError::Lifecycle(LifecycleError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_wait_ready_returns_immediately_when_ready() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_initialized().expect("init");
        lifecycle.mark_ready().expect("ready");
        lifecycle
            .wait_ready(Duration::from_millis(1))
            .await
            .expect("already ready");
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_transition() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_ready(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.mark_initialized().expect("init");
        lifecycle.mark_ready().expect("ready");

        waiter.await.expect("join").expect("waiter sees ready");
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_stopped() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_ready(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.mark_stopped();

        let result = waiter.await.expect("join");
        assert!(matches!(
            result,
            Err(IndexError::Lifecycle(LifecycleError::Stopped))
        ));
    }
}
