use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "taskstatus", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Abandoned,
}

impl TaskStatus {
    /// Terminal states are never left again; a redelivered terminal task is
    /// acked and discarded without execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::TaskStatus;

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Abandoned.is_terminal());
    }
}
