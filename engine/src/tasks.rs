//! Durable task tracking for long directives.
//!
//! Directives with many operations register a task so callers can poll
//! progress. Progress is a percentage that never moves backwards, and a
//! task that reached a terminal state never leaves it.
//!
//! The in-memory tracker forgets finished tasks after a retention period,
//! and keeps at most a fixed number of them.

use crate::config::TaskConfig;
use crate::errors::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directive_protocol::DirectiveId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub directive_id: DirectiveId,
    pub state: TaskState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Error type for task lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    #[error("task already terminal: {task_id} ({state:?})")]
    AlreadyTerminal { task_id: String, state: TaskState },

    #[error("progress {0} outside 0..=100")]
    ProgressOutOfRange(u8),

    #[error("progress for {task_id} cannot go from {current} back to {requested}")]
    ProgressRegressed {
        task_id: String,
        current: u8,
        requested: u8,
    },
}

impl From<TaskError> for EngineError {
    fn from(err: TaskError) -> Self {
        EngineError::task(err.to_string())
    }
}

#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn create_task(&self, directive_id: &DirectiveId) -> Result<String, TaskError>;

    async fn update_progress(
        &self,
        task_id: &str,
        percent: u8,
        note: Option<&str>,
    ) -> Result<(), TaskError>;

    /// Park the task until the caller supplies input.
    async fn request_input(&self, task_id: &str, note: &str) -> Result<(), TaskError>;

    async fn complete_task(&self, task_id: &str, summary: Option<&str>) -> Result<(), TaskError>;

    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<(), TaskError>;

    /// Cancelling a terminal task is not an error; the current state is
    /// returned unchanged.
    async fn cancel_task(&self, task_id: &str) -> Result<TaskState, TaskError>;

    async fn get_task(&self, task_id: &str) -> Option<TaskRecord>;
}

/// Process-local tracker.
#[derive(Debug, Clone)]
pub struct InMemoryTaskTracker {
    tasks: Arc<Mutex<HashMap<String, TaskRecord>>>,
    retention: Duration,
    max_finished: usize,
}

impl Default for InMemoryTaskTracker {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

impl InMemoryTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            retention: Duration::from_secs(config.retention_secs),
            max_finished: config.max_finished,
        }
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Drop finished tasks past retention, then the oldest finished ones
    /// beyond `max_finished`. Working tasks are never dropped.
    fn prune(&self, tasks: &mut HashMap<String, TaskRecord>, now: DateTime<Utc>) {
        let before = tasks.len();
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        tasks.retain(|_, record| {
            !record.state.is_terminal() || now.signed_duration_since(record.updated_at) < retention
        });

        let mut finished: Vec<(DateTime<Utc>, String)> = tasks
            .values()
            .filter(|record| record.state.is_terminal())
            .map(|record| (record.updated_at, record.task_id.clone()))
            .collect();
        if finished.len() > self.max_finished {
            finished.sort();
            let excess = finished.len() - self.max_finished;
            for (_, task_id) in finished.into_iter().take(excess) {
                tasks.remove(&task_id);
            }
        }

        let dropped = before - tasks.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = tasks.len(), "finished tasks pruned");
        }
    }

    /// Apply `f` to a non-terminal task.
    async fn transition<F>(&self, task_id: &str, f: F) -> Result<(), TaskError>
    where
        F: FnOnce(&mut TaskRecord) -> Result<(), TaskError> + Send,
    {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(task_id).ok_or_else(|| TaskError::NotFound {
            task_id: task_id.to_string(),
        })?;
        if record.state.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: task_id.to_string(),
                state: record.state,
            });
        }
        f(record)?;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskTracker for InMemoryTaskTracker {
    async fn create_task(&self, directive_id: &DirectiveId) -> Result<String, TaskError> {
        let task_id = format!("task-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let record = TaskRecord {
            task_id: task_id.clone(),
            directive_id: directive_id.clone(),
            state: TaskState::Working,
            progress: 0,
            note: None,
            created_at: now,
            updated_at: now,
        };
        let mut tasks = self.tasks.lock().await;
        self.prune(&mut tasks, now);
        tasks.insert(task_id.clone(), record);
        drop(tasks);
        tracing::debug!(task_id = %task_id, directive_id = %directive_id, "task created");
        Ok(task_id)
    }

    async fn update_progress(
        &self,
        task_id: &str,
        percent: u8,
        note: Option<&str>,
    ) -> Result<(), TaskError> {
        if percent > 100 {
            return Err(TaskError::ProgressOutOfRange(percent));
        }
        self.transition(task_id, |record| {
            if percent < record.progress {
                return Err(TaskError::ProgressRegressed {
                    task_id: record.task_id.clone(),
                    current: record.progress,
                    requested: percent,
                });
            }
            record.progress = percent;
            record.state = TaskState::Working;
            if let Some(note) = note {
                record.note = Some(note.to_string());
            }
            Ok(())
        })
        .await
    }

    async fn request_input(&self, task_id: &str, note: &str) -> Result<(), TaskError> {
        self.transition(task_id, |record| {
            record.state = TaskState::InputRequired;
            record.note = Some(note.to_string());
            Ok(())
        })
        .await
    }

    async fn complete_task(&self, task_id: &str, summary: Option<&str>) -> Result<(), TaskError> {
        self.transition(task_id, |record| {
            record.state = TaskState::Completed;
            record.progress = 100;
            if let Some(summary) = summary {
                record.note = Some(summary.to_string());
            }
            Ok(())
        })
        .await
    }

    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<(), TaskError> {
        self.transition(task_id, |record| {
            record.state = TaskState::Failed;
            record.note = Some(reason.to_string());
            Ok(())
        })
        .await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<TaskState, TaskError> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(task_id).ok_or_else(|| TaskError::NotFound {
            task_id: task_id.to_string(),
        })?;
        if !record.state.is_terminal() {
            record.state = TaskState::Cancelled;
            record.note = Some("Cancelled by caller".to_string());
            record.updated_at = Utc::now();
        }
        Ok(record.state)
    }

    async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.lock().await.get(task_id).cloned()
    }
}
