use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResourceError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// No heavy-task slot freed up before the deadline.
    #[error("Timed out after {timeout_ms}ms waiting for resources for '{task}' (active: {active:?})")]
    Timeout {
        task: String,
        timeout_ms: u64,
        active: Vec<String>,
    },

    #[error("'{0}' is not a registered heavy task")]
    NotHeavyTask(String),
}

impl ResourceError {
    /// Whether this error came from waiting on a bounded resource.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
