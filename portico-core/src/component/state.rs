use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a component, in the only order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Initialised,
    Started,
    Finalised,
    ShuttingDown,
    Shutdown,
    Terminated,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Initialised => "initialised",
            ComponentState::Started => "started",
            ComponentState::Finalised => "finalised",
            ComponentState::ShuttingDown => "shutting-down",
            ComponentState::Shutdown => "shutdown",
            ComponentState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_totally_ordered() {
        use ComponentState::*;
        let states = [Initialised, Started, Finalised, ShuttingDown, Shutdown, Terminated];
        assert!(states.windows(2).all(|w| w[0] < w[1]));
        assert_eq!("shutting-down", ShuttingDown.to_string());
        assert_eq!(
            "\"shutting_down\"",
            serde_json::to_string(&ShuttingDown).unwrap()
        );
    }
}
