use serde::Serialize;

/// Lifecycle of an upload job.
///
/// `Pending -> Processing -> {Completed | Pending | Failed}`; the only
/// backwards edge is a retry putting a `Processing` job back to `Pending`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_become(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus::*;

    #[test]
    fn test_transitions() {
        assert!(Pending.can_become(Processing));
        assert!(Processing.can_become(Pending));
        assert!(Processing.can_become(Completed));
        assert!(Processing.can_become(Failed));

        assert!(!Pending.can_become(Completed));
        assert!(!Completed.can_become(Pending));
        assert!(!Failed.can_become(Processing));
        assert!(!Completed.can_become(Failed));

        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Pending.is_terminal() && !Processing.is_terminal());
    }

    #[test]
    fn test_serialises_as_word() {
        for (status, word) in [
            (Pending, "pending\n"),
            (Processing, "processing\n"),
            (Completed, "completed\n"),
            (Failed, "failed\n"),
        ] {
            assert_eq!(serde_yaml::to_string(&status).unwrap(), word);
        }
    }
}
