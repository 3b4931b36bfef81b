use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Queue priority; lower ordinal is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Dequeue order
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("Unknown priority '{}'", other)),
        }
    }
}

/// Kind of message; selects the handler
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    Notification,
    WorkflowUpdate,
    Presence,
    System,
    Custom(String),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Chat => f.write_str("chat"),
            MessageType::Notification => f.write_str("notification"),
            MessageType::WorkflowUpdate => f.write_str("workflow_update"),
            MessageType::Presence => f.write_str("presence"),
            MessageType::System => f.write_str("system"),
            MessageType::Custom(name) => f.write_str(name),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "chat" => MessageType::Chat,
            "notification" => MessageType::Notification,
            "workflow_update" => MessageType::WorkflowUpdate,
            "presence" => MessageType::Presence,
            "system" => MessageType::System,
            other => MessageType::Custom(other.to_string()),
        }
    }
}

/// Opaque payload plus its type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(message_type: impl Into<MessageType>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }
}

/// Queued unit of work
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: Uuid,
    pub message: Message,
    pub session_id: String,
    pub user_id: Option<String>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Error whose recovery this attempt is retrying
    pub recovery_id: Option<Uuid>,
}

impl Task {
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<String>,
        message: Message,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            message,
            session_id: session_id.into(),
            user_id,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            recovery_id: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(priorities, Priority::ALL.to_vec());
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::from("workflow_update"), MessageType::WorkflowUpdate);
        assert_eq!(
            MessageType::from("typing"),
            MessageType::Custom("typing".to_string())
        );
        assert_eq!(MessageType::Custom("typing".into()).to_string(), "typing");
    }
}
