//! Batch data model and the read-only snapshots handed to observers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::fs::FileMetadata;

pub type ItemId = u64;

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

fn next_item_id() -> ItemId {
    NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Compressing,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Success | ItemStatus::Failed | ItemStatus::Skipped | ItemStatus::Cancelled
        )
    }

    /// Allowed lifecycle moves. `Pending` is re-entered only by a new run.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Compressing)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Compressing, Success)
                | (Compressing, Failed)
                | (Compressing, Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub extension: String,
}

impl From<FileMetadata> for OutputDescriptor {
    fn from(meta: FileMetadata) -> Self {
        Self {
            path: meta.path,
            name: meta.file_name,
            size: meta.size,
            extension: meta.extension,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: ItemId,
    pub path: PathBuf,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub status: ItemStatus,
    pub progress: f64,
    pub duration: Option<f64>,
    pub error: Option<String>,
    pub output: Option<OutputDescriptor>,
}

impl BatchItem {
    pub fn new(meta: FileMetadata) -> Self {
        Self {
            id: next_item_id(),
            path: meta.path,
            name: meta.file_name,
            extension: meta.extension,
            size: meta.size,
            status: ItemStatus::Pending,
            progress: 0.0,
            duration: None,
            error: None,
            output: None,
        }
    }

    /// Back to a fresh `Pending` state for a new run.
    pub fn reset(&mut self) {
        self.status = ItemStatus::Pending;
        self.progress = 0.0;
        self.error = None;
        self.output = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Consistent copy of the orchestrator state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRunSnapshot {
    pub items: Vec<BatchItem>,
    pub phase: RunPhase,
    pub is_running: bool,
    pub is_completed: bool,
    pub cancel_requested: bool,
    pub current_item_id: Option<ItemId>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub cancelled_count: usize,
}

impl BatchRunSnapshot {
    pub fn item(&self, id: ItemId) -> Option<&BatchItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn terminal_count(&self) -> usize {
        self.items.iter().filter(|i| i.status.is_terminal()).count()
    }
}

/// Pushed to observers while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted { item_count: usize },
    #[serde(rename_all = "camelCase")]
    ItemStatus {
        item_id: ItemId,
        status: ItemStatus,
        error: Option<String>,
        output: Option<OutputDescriptor>,
    },
    #[serde(rename_all = "camelCase")]
    ItemProgress { item_id: ItemId, progress: f64 },
    RunFinished(BatchRunSnapshot),
}
