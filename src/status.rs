// src/status.rs — execution-state vocabulary shared by devices, channels, and requests

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of execution-state tags. Device status, per-channel status, and
/// request outcomes all speak this vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Warning,
    Busy,
    Invalid,
    Todo,
    Idle,
    Up,
    Down,
}

impl Status {
    /// A device or channel in this state accepts new commands; it is also the
    /// signal that previously dispatched work has finished.
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Up | Status::Idle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::Warning => "warning",
            Status::Busy => "busy",
            Status::Invalid => "invalid",
            Status::Todo => "todo",
            Status::Idle => "idle",
            Status::Up => "up",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(Status::Success),
            "error" => Ok(Status::Error),
            "warning" => Ok(Status::Warning),
            "busy" => Ok(Status::Busy),
            "invalid" => Ok(Status::Invalid),
            "todo" => Ok(Status::Todo),
            "idle" => Ok(Status::Idle),
            "up" => Ok(Status::Up),
            "down" => Ok(Status::Down),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serde_round_trip() {
        for s in [
            Status::Success,
            Status::Error,
            Status::Warning,
            Status::Busy,
            Status::Invalid,
            Status::Todo,
            Status::Idle,
            Status::Up,
            Status::Down,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s.as_str()));
            let back: Status = serde_json::from_str(&json).unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn ready_states() {
        assert!(Status::Up.is_ready());
        assert!(Status::Idle.is_ready());
        assert!(!Status::Busy.is_ready());
        assert!(!Status::Down.is_ready());
    }

    #[test]
    fn parses_case_insensitive() {
        assert_eq!("BUSY".parse::<Status>(), Ok(Status::Busy));
        assert!("unknown".parse::<Status>().is_err());
    }
}
