//! In-flight job tracking consulted before eviction.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use corral_core::ProjectId;

/// Tells the cache which entries background work still depends on.
pub trait JobRegistry: Send + Sync {
    /// True while at least one job references `project_id`.
    fn is_referenced(&self, project_id: ProjectId) -> bool;
}

/// Registry with no jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJobs;

impl JobRegistry for NoJobs {
    fn is_referenced(&self, _project_id: ProjectId) -> bool {
        false
    }
}

/// Reference-counted job registry kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobs {
    active: Mutex<HashMap<ProjectId, usize>>,
}

impl InMemoryJobs {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job referencing `project_id`.
    pub fn register(&self, project_id: ProjectId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active.entry(project_id).or_default() += 1;
    }

    /// Record that one job referencing `project_id` finished.
    pub fn complete(&self, project_id: ProjectId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(&project_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&project_id);
            }
        }
    }
}

impl JobRegistry for InMemoryJobs {
    fn is_referenced(&self, project_id: ProjectId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&project_id)
    }
}
