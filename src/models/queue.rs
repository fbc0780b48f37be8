use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::invoice::Invoice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Report,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Authority refused the invoice; needs a corrected re-issue.
    Rejected,
    /// Gave up after `max_attempts` network failures.
    RetriesExhausted,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} `{}`", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(Operation { Report => "report", Clear => "clear" });
text_enum!(QueueStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});
text_enum!(FailureKind { Rejected => "rejected", RetriesExhausted => "retries_exhausted" });

/// An invoice waiting for submission to the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    /// Position in enqueue order; drains walk entries by this value.
    pub seq: i64,
    pub invoice: Invoice,
    pub operation: Operation,
    pub status: QueueStatus,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub reference: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(invoice: Invoice, operation: Operation, now: DateTime<Utc>) -> Self {
        QueueEntry {
            id: Uuid::new_v4(),
            seq: 0,
            invoice,
            operation,
            status: QueueStatus::Pending,
            attempts: 0,
            next_retry_at: now,
            last_error: None,
            failure: None,
            reference: None,
            enqueued_at: now,
            last_attempt_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, QueueStatus::Completed | QueueStatus::Failed)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.next_retry_at <= now
    }

    /// Still outstanding past the compliance deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>, deadline: chrono::Duration) -> bool {
        !self.is_terminal() && now > self.enqueued_at + deadline
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a QueueEntry>) -> Self {
        let mut stats = QueueStats::default();
        for entry in entries {
            stats.total += 1;
            match entry.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trips() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("done".parse::<QueueStatus>().is_err());
        assert_eq!("retries_exhausted".parse::<FailureKind>().unwrap(), FailureKind::RetriesExhausted);
    }
}
