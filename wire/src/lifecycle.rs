use serde::{Deserialize, Serialize};

/// Guest startup state machine (§3). Forward-only; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestLifecycle {
    Booting,
    Meshing,
    AgentStarting,
    Registered,
    Draining,
    Failed,
}

impl GuestLifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, GuestLifecycle::Failed)
    }

    /// Whether `self -> next` is a legal forward transition. `Failed` is
    /// reachable from any state; `Draining` is reachable once registered.
    pub fn can_transition_to(self, next: GuestLifecycle) -> bool {
        use GuestLifecycle::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Booting, Meshing)
                | (Meshing, AgentStarting)
                | (AgentStarting, Registered)
                | (Registered, Draining)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GuestLifecycle::*;

    #[test]
    fn forward_transitions_are_legal() {
        assert!(Booting.can_transition_to(Meshing));
        assert!(Meshing.can_transition_to(AgentStarting));
        assert!(AgentStarting.can_transition_to(Registered));
        assert!(Registered.can_transition_to(Draining));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        for s in [Booting, Meshing, AgentStarting, Registered, Draining] {
            assert!(s.can_transition_to(Failed));
        }
    }

    #[test]
    fn failed_is_terminal() {
        assert!(Failed.is_terminal());
        assert!(!Failed.can_transition_to(Booting));
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!Booting.can_transition_to(Registered));
        assert!(!Booting.can_transition_to(Booting));
    }
}
