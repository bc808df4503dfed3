//! Task records and handler outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use reckon_core::{AccountId, TaskId};

/// Stable task id derived from a natural key, so re-enqueuing the same work
/// overwrites the pending task instead of duplicating it.
pub fn derived_task_id(key: &str) -> TaskId {
    TaskId::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}

/// Closed set of task types; drives dispatch.
///
/// Any tag this build does not know deserializes to `Unknown` so the record can be
/// drained instead of blocking the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Generate the invoice for the period starting at the task's `created`.
    GenerateInvoice,
    /// Deliver a generated invoice (`invoiceId` in task data).
    DeliverInvoice,
    #[serde(other)]
    Unknown,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::GenerateInvoice => "GENERATE_INVOICE",
            TaskType::DeliverInvoice => "DELIVER_INVOICE",
            TaskType::Unknown => "UNKNOWN",
        }
    }

    /// Parse a stored tag; unrecognized tags become `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "GENERATE_INVOICE" => TaskType::GenerateInvoice,
            "DELIVER_INVOICE" => TaskType::DeliverInvoice,
            _ => TaskType::Unknown,
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive value stored in a task's parameter map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<i64> for TaskValue {
    fn from(v: i64) -> Self {
        TaskValue::Int(v)
    }
}

impl From<f64> for TaskValue {
    fn from(v: f64) -> Self {
        TaskValue::Float(v)
    }
}

impl From<bool> for TaskValue {
    fn from(v: bool) -> Self {
        TaskValue::Bool(v)
    }
}

impl From<String> for TaskValue {
    fn from(v: String) -> Self {
        TaskValue::Text(v)
    }
}

impl From<&str> for TaskValue {
    fn from(v: &str) -> Self {
        TaskValue::Text(v.to_string())
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    /// Owner key: the account this task affects.
    pub account_id: AccountId,
    pub task_type: TaskType,
    /// Enqueue time; for period tasks, the start of the period being processed.
    pub created: DateTime<Utc>,
    /// Handler-specific parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_data: BTreeMap<String, TaskValue>,
}

impl TaskRecord {
    pub fn new(account_id: AccountId, task_type: TaskType) -> Self {
        Self {
            id: TaskId::new(),
            account_id,
            task_type,
            created: Utc::now(),
            task_data: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn created_at(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<TaskValue>) -> Self {
        self.task_data.insert(key.into(), value.into());
        self
    }

    pub fn data(&self, key: &str) -> Option<&TaskValue> {
        self.task_data.get(key)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        match self.task_data.get(key) {
            Some(TaskValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        match self.task_data.get(key) {
            Some(TaskValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Result of running a handler against one task.
///
/// - `Success` and `Fatal` remove the task.
/// - `Retry` leaves it in the store for a later claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Retry(String),
    Fatal(String),
}

impl TaskOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Whether the claimed task should be deleted.
    pub fn removes_task(&self) -> bool {
        !matches!(self, TaskOutcome::Retry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_task_tags_deserialize_as_unknown() {
        let t: TaskType = serde_json::from_str("\"GENERATE_INVOICE\"").unwrap();
        assert_eq!(t, TaskType::GenerateInvoice);

        let t: TaskType = serde_json::from_str("\"RECALCULATE_TAX\"").unwrap();
        assert_eq!(t, TaskType::Unknown);

        assert_eq!(TaskType::from_tag("nope"), TaskType::Unknown);
        assert_eq!(TaskType::from_tag(TaskType::DeliverInvoice.as_str()), TaskType::DeliverInvoice);
    }

    #[test]
    fn task_data_keeps_primitive_types() {
        let task = TaskRecord::new(AccountId::new(), TaskType::DeliverInvoice)
            .with_data("invoiceId", "abc")
            .with_data("attempt", 3i64)
            .with_data("ratio", 0.5f64)
            .with_data("force", true);

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["taskType"], "DELIVER_INVOICE");
        assert_eq!(json["taskData"]["attempt"], 3);

        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.data_str("invoiceId"), Some("abc"));
        assert_eq!(back.data_i64("attempt"), Some(3));
        assert_eq!(back.data("ratio"), Some(&TaskValue::Float(0.5)));
        assert_eq!(back.data("force"), Some(&TaskValue::Bool(true)));
        assert_eq!(back.data_i64("invoiceId"), None);
    }

    #[test]
    fn derived_ids_are_stable_per_key() {
        assert_eq!(derived_task_id("a:1"), derived_task_id("a:1"));
        assert_ne!(derived_task_id("a:1"), derived_task_id("a:2"));
    }

    #[test]
    fn only_retry_keeps_the_task() {
        assert!(TaskOutcome::Success.removes_task());
        assert!(TaskOutcome::fatal("bad data").removes_task());
        assert!(!TaskOutcome::retry("busy").removes_task());
    }
}
