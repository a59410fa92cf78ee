use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Global operating mode, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SystemMode {
    Normal = 0,
    SafeMode = 1,
    Fallback = 2,
    Lockdown = 3,
}

impl SystemMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SystemMode::Normal),
            1 => Some(SystemMode::SafeMode),
            2 => Some(SystemMode::Fallback),
            3 => Some(SystemMode::Lockdown),
            _ => None,
        }
    }

    /// True for every mode other than NORMAL.
    pub fn is_degraded(self) -> bool {
        self != SystemMode::Normal
    }

    /// Whether an ordinary transition may move from `self` to `to`.
    ///
    /// LOCKDOWN is reachable from anywhere but is only left through an
    /// explicit, second-factor authorized unlock.
    pub fn can_transition_to(self, to: SystemMode) -> bool {
        match (self, to) {
            (a, b) if a == b => false,
            (SystemMode::Lockdown, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemMode::Normal => "NORMAL",
            SystemMode::SafeMode => "SAFE_MODE",
            SystemMode::Fallback => "FALLBACK",
            SystemMode::Lockdown => "LOCKDOWN",
        };
        f.write_str(s)
    }
}

impl FromStr for SystemMode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NORMAL" => Ok(SystemMode::Normal),
            "SAFE_MODE" | "SAFE" => Ok(SystemMode::SafeMode),
            "FALLBACK" => Ok(SystemMode::Fallback),
            "LOCKDOWN" => Ok(SystemMode::Lockdown),
            other => Err(WardenError::Serialization(format!("unknown mode: {other}"))),
        }
    }
}

/// Current mode plus why and when it was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub mode: SystemMode,
    pub reason: String,
    pub since: DateTime<Utc>,
}

impl SystemState {
    pub fn initial() -> Self {
        Self {
            mode: SystemMode::Normal,
            reason: "startup".into(),
            since: Utc::now(),
        }
    }
}
