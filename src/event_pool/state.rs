//! Pending Transfer Status Definitions
//!
//! Status IDs are stable for PostgreSQL storage as SMALLINT.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pending transfer status
///
/// ```text
/// PENDING → CHECKING → APPROVED → COMPLETED
///    ↓          ↓          ↓
///    └──────→ REJECTED ←───┘
/// ```
///
/// Terminal states: COMPLETED (30), REJECTED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TransferStatus {
    /// Recorded, predicates not yet dispatched
    Pending = 0,

    /// Predicates dispatched, waiting for results (or a scheduled retry)
    Checking = 10,

    /// All predicates passed; exactly one worker owns execution
    Approved = 20,

    /// Terminal: transfer executed
    Completed = 30,

    /// Terminal: rejected with a reason code
    Rejected = -10,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 5] = [
        TransferStatus::Pending,
        TransferStatus::Checking,
        TransferStatus::Approved,
        TransferStatus::Completed,
        TransferStatus::Rejected,
    ];

    /// Check if this is a terminal state (record is immutable)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Rejected)
    }

    /// Whether a status write `self → next` is allowed.
    ///
    /// `Checking → Checking` (a retry round) is not a status write and is
    /// therefore not listed here.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Checking)
                | (Checking, Approved)
                | (Approved, Completed)
                | (Pending, Rejected)
                | (Checking, Rejected)
                | (Approved, Rejected)
        )
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            10 => Some(TransferStatus::Checking),
            20 => Some(TransferStatus::Approved),
            30 => Some(TransferStatus::Completed),
            -10 => Some(TransferStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Checking => "checking",
            TransferStatus::Approved => "approved",
            TransferStatus::Completed => "completed",
            TransferStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown transfer status: {}", s))
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Rejected.is_terminal());

        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::Checking.is_terminal());
        assert!(!TransferStatus::Approved.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        use TransferStatus::*;

        assert!(Pending.can_transition_to(Checking));
        assert!(Checking.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Completed));
        for from in [Pending, Checking, Approved] {
            assert!(from.can_transition_to(Rejected), "{} -> rejected", from);
        }

        // No skipping ahead, no going back, nothing out of terminal
        assert!(!Pending.can_transition_to(Approved));
        assert!(!Checking.can_transition_to(Completed));
        assert!(!Approved.can_transition_to(Checking));
        assert!(!Checking.can_transition_to(Checking));
        for next in TransferStatus::ALL {
            assert!(!Completed.can_transition_to(next));
            assert!(!Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn test_status_id_roundtrip() {
        for status in TransferStatus::ALL {
            assert_eq!(TransferStatus::from_id(status.id()), Some(status));
        }
        assert!(TransferStatus::from_id(999).is_none());
        assert!(TransferStatus::try_from(-999).is_err());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("checking".parse::<TransferStatus>(), Ok(TransferStatus::Checking));
        assert_eq!("REJECTED".parse::<TransferStatus>(), Ok(TransferStatus::Rejected));
        assert!("init".parse::<TransferStatus>().is_err());
        assert_eq!(TransferStatus::Completed.to_string(), "completed");
    }
}
