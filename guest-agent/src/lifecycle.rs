//! Guards `tpc_wire::GuestLifecycle`'s forward-only transitions behind a
//! single mutex, so the bootstrap handler and keepalive task can both
//! observe and advance the same state machine (§3 guest lifecycle state).

use tokio::sync::RwLock;
use tpc_wire::GuestLifecycle;

pub struct LifecycleTracker {
    state: RwLock<GuestLifecycle>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self { state: RwLock::new(GuestLifecycle::Booting) }
    }

    pub async fn current(&self) -> GuestLifecycle {
        *self.state.read().await
    }

    /// Advances to `next` if the transition is legal; logs and leaves state
    /// untouched otherwise (a caller bug, not a runtime condition to
    /// recover from).
    pub async fn advance(&self, next: GuestLifecycle) {
        let mut state = self.state.write().await;
        if state.can_transition_to(next) {
            tracing::info!(from = ?*state, to = ?next, "guest lifecycle transition");
            *state = next;
        } else {
            tracing::error!(from = ?*state, to = ?next, "illegal guest lifecycle transition requested");
        }
    }

    pub async fn fail(&self) {
        self.advance(GuestLifecycle::Failed).await;
    }

    pub async fn is_failed(&self) -> bool {
        self.current().await.is_terminal()
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn follows_forward_path() {
        let tracker = LifecycleTracker::new();
        tracker.advance(GuestLifecycle::Meshing).await;
        assert_eq!(tracker.current().await, GuestLifecycle::Meshing);
        tracker.advance(GuestLifecycle::AgentStarting).await;
        assert_eq!(tracker.current().await, GuestLifecycle::AgentStarting);
        tracker.advance(GuestLifecycle::Registered).await;
        assert_eq!(tracker.current().await, GuestLifecycle::Registered);
    }

    #[tokio::test]
    async fn rejects_illegal_skip() {
        let tracker = LifecycleTracker::new();
        tracker.advance(GuestLifecycle::Registered).await;
        assert_eq!(tracker.current().await, GuestLifecycle::Booting);
    }

    #[tokio::test]
    async fn fail_is_reachable_and_terminal() {
        let tracker = LifecycleTracker::new();
        tracker.fail().await;
        assert!(tracker.is_failed().await);
        tracker.advance(GuestLifecycle::Meshing).await;
        assert!(tracker.is_failed().await);
    }
}
