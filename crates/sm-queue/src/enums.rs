use serde::{Deserialize, Serialize};

/// Message queue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    /// Sent to the agent, awaiting acknowledgment.
    Sent,
    Completed,
    Failed,
    Expired,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "sent" => Some(Self::Sent),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDirection {
    /// Messages to send to agents.
    Outbound,
    /// Messages received from agents.
    Inbound,
}

impl QueueDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// Message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }

    /// Rank used when ordering dequeued messages; unknown strings rank 0.
    pub fn rank_of(s: &str) -> u8 {
        match Self::parse(s) {
            Some(Self::Urgent) => 4,
            Some(Self::High) => 3,
            Some(Self::Normal) => 2,
            Some(Self::Low) => 1,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["pending", "in_progress", "sent", "completed", "failed", "expired"] {
            assert_eq!(QueueStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(QueueStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_priority_ranks() {
        assert_eq!(Priority::rank_of("urgent"), 4);
        assert_eq!(Priority::rank_of("high"), 3);
        assert_eq!(Priority::rank_of("normal"), 2);
        assert_eq!(Priority::rank_of("low"), 1);
        assert_eq!(Priority::rank_of("unknown"), 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(QueueStatus::Expired.is_terminal());
        assert!(!QueueStatus::Sent.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
    }
}
