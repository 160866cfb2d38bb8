use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const MAX_TASK_LABEL_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// A single checklist item on a session's Todo list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    /// What needs to be done, imperative form.
    pub content: String,
    pub status: TodoStatus,
    /// Present continuous form shown while the item is in progress.
    #[serde(default)]
    pub active_form: String,
}

/// Per-status counts over a Todo list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl TodoCounts {
    pub fn from_items(items: &[TodoItem]) -> Self {
        items.iter().fold(Self::default(), |mut acc, item| {
            match item.status {
                TodoStatus::Pending => acc.pending += 1,
                TodoStatus::InProgress => acc.in_progress += 1,
                TodoStatus::Completed => acc.completed += 1,
            }
            acc
        })
    }
}

/// Progress summary for the UI indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoProgress {
    pub completed: usize,
    pub total: usize,
    /// Label of the first in-progress item, if any.
    pub current: Option<String>,
}

impl TodoProgress {
    pub fn from_items(items: &[TodoItem]) -> Option<Self> {
        if items.is_empty() {
            return None;
        }
        let completed = items.iter().filter(|t| t.status == TodoStatus::Completed).count();
        let current = items
            .iter()
            .find(|t| t.status == TodoStatus::InProgress)
            .map(|t| {
                let label = if t.active_form.is_empty() {
                    &t.content
                } else {
                    &t.active_form
                };
                truncate_label(label, MAX_TASK_LABEL_CHARS)
            });
        Some(Self {
            completed,
            total: items.len(),
            current,
        })
    }

    pub fn render(&self) -> String {
        match &self.current {
            Some(task) => format!("To-Do {}/{}  {}", self.completed, self.total, task),
            None => format!("To-Do {}/{}", self.completed, self.total),
        }
    }
}

fn truncate_label(label: &str, max_chars: usize) -> String {
    if label.chars().count() <= max_chars {
        return label.to_string();
    }
    let mut out: String = label.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

/// Shared handle to a session's Todo list, readable while a turn runs.
#[derive(Clone, Debug, Default)]
pub struct SharedTodos {
    inner: Arc<RwLock<Vec<TodoItem>>>,
}

impl SharedTodos {
    pub fn new(items: Vec<TodoItem>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(items)),
        }
    }

    pub fn snapshot(&self) -> Vec<TodoItem> {
        self.inner.read().clone()
    }

    pub fn replace(&self, items: Vec<TodoItem>) {
        *self.inner.write() = items;
    }
}
