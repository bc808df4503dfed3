//! Task handler registry.

use std::collections::HashMap;

use super::types::{TaskOutcome, TaskRecord, TaskType};

/// Task handler function type.
pub type TaskHandler = Box<dyn Fn(&TaskRecord) -> TaskOutcome + Send + Sync>;

/// Result of routing a task to its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled(TaskOutcome),
    /// No handler for the task's type; the task is drained.
    Unhandled,
}

/// Maps task types to handlers.
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<TaskType, TaskHandler>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `task_type`.
    pub fn register<F>(&mut self, task_type: TaskType, handler: F)
    where
        F: Fn(&TaskRecord) -> TaskOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(task_type, Box::new(handler));
    }

    pub fn dispatch(&self, task: &TaskRecord) -> Dispatch {
        if task.task_type == TaskType::Unknown {
            return Dispatch::Unhandled;
        }
        match self.handlers.get(&task.task_type) {
            Some(handler) => Dispatch::Handled(handler(task)),
            None => Dispatch::Unhandled,
        }
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
