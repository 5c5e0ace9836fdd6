use serde::Serialize;

/// Result of one claim/dispatch/finalize iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Nothing was pending.
    Idle,
    Completed {
        task_id: String,
        result_path: Option<String>,
    },
    Failed {
        task_id: String,
        error: String,
    },
    /// The engine ran but the claim was no longer ours, so its result was
    /// dropped.
    Discarded { task_id: String },
}

impl PollOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, PollOutcome::Idle)
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            PollOutcome::Idle => None,
            PollOutcome::Completed { task_id, .. }
            | PollOutcome::Failed { task_id, .. }
            | PollOutcome::Discarded { task_id } => Some(task_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_shape() {
        let outcome = PollOutcome::Failed {
            task_id: "t1".to_string(),
            error: "EngineFailed: bad".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"outcome": "failed", "task_id": "t1", "error": "EngineFailed: bad"})
        );
        assert_eq!(
            serde_json::to_value(PollOutcome::Idle).unwrap(),
            serde_json::json!({"outcome": "idle"})
        );
    }

    #[test]
    fn test_task_id_accessor() {
        assert_eq!(PollOutcome::Idle.task_id(), None);
        let done = PollOutcome::Discarded {
            task_id: "t2".to_string(),
        };
        assert_eq!(done.task_id(), Some("t2"));
        assert!(!done.is_idle());
    }
}
