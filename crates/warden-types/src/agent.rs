use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable name of a supervised agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle of one agent incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Starting,
    Running,
    Unresponsive,
    Quarantined,
    Stopped,
}

impl AgentState {
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Unresponsive)
                | (Starting, Stopped)
                | (Running, Unresponsive)
                | (Running, Stopped)
                | (Unresponsive, Running)
                | (Unresponsive, Starting)
                | (Unresponsive, Quarantined)
                | (Unresponsive, Stopped)
                | (Quarantined, Starting)
                | (Quarantined, Stopped)
                | (Stopped, Starting)
        )
    }

    /// Whether the agent currently accepts work.
    pub fn is_serving(self) -> bool {
        self == AgentState::Running
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Starting => "STARTING",
            AgentState::Running => "RUNNING",
            AgentState::Unresponsive => "UNRESPONSIVE",
            AgentState::Quarantined => "QUARANTINED",
            AgentState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}
