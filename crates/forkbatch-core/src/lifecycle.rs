use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker process.
///
/// `ShuttingDown` is terminal: once entered, no other state can replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LifecycleState {
    /// Reserving and executing jobs
    Running = 0,
    /// Not starting new jobs until resumed
    Paused = 1,
    /// Draining; exits at the next opportunity
    ShuttingDown = 2,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::ShuttingDown => "shutting_down",
        }
    }

    /// Raw representation, suitable for an atomic slot
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a raw value; unknown values map to `ShuttingDown`
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Running,
            1 => LifecycleState::Paused,
            _ => LifecycleState::ShuttingDown,
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Running
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        for state in [
            LifecycleState::Running,
            LifecycleState::Paused,
            LifecycleState::ShuttingDown,
        ] {
            assert_eq!(LifecycleState::from_u8(state.as_u8()), state);
        }
        assert_eq!(LifecycleState::from_u8(42), LifecycleState::ShuttingDown);
    }
}
