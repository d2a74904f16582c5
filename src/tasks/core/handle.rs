//! Backend-issued task identifiers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier a backend assigns to a submitted task.
///
/// Some services hand out integers and others strings; the original shape is
/// kept so it can be echoed back verbatim on poll and feedback calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(u64),
    Text(String),
}

impl TaskId {
    pub fn as_string(&self) -> String {
        self.to_string()
    }

    /// JSON value matching the shape the backend used when issuing the id.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TaskId::Number(value) => serde_json::Value::from(*value),
            TaskId::Text(value) => serde_json::Value::from(value.as_str()),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Number(value) => write!(f, "{value}"),
            TaskId::Text(value) => f.write_str(value),
        }
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        TaskId::Number(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId::Text(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId::Text(value)
    }
}

/// A submitted task, owned by the lifecycle engine for the length of a solve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    id: TaskId,
    provider: &'static str,
    submitted_at: DateTime<Utc>,
}

impl TaskHandle {
    pub fn new(id: TaskId, provider: &'static str) -> Self {
        Self {
            id,
            provider,
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_backend_shape() {
        let numeric: TaskId = serde_json::from_str("7654321").unwrap();
        assert_eq!(numeric, TaskId::Number(7654321));
        assert_eq!(numeric.to_json(), serde_json::json!(7654321));

        let text: TaskId = serde_json::from_str("\"a8f3-11\"").unwrap();
        assert_eq!(text, TaskId::from("a8f3-11"));
        assert_eq!(text.to_string(), "a8f3-11");
    }
}
