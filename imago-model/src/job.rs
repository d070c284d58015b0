//! The `BackgroundJob` aggregate: one record per pipeline run, with a map
//! of named stages whose counters are incremented atomically by many
//! concurrent workers and closed by the monitor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{CollectionId, JobId, LibraryId};

/// Stage names recognized by the ingestion pipeline.
pub const STAGE_SCAN: &str = "scan";
pub const STAGE_THUMBNAIL: &str = "thumbnail";
pub const STAGE_CACHE: &str = "cache";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    LibraryScan,
    CollectionScan,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStage {
    pub status: StageStatus,
    pub total_items: u64,
    pub completed_items: u64,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobStage {
    pub fn planned(total_items: u64) -> Self {
        Self {
            status: StageStatus::Pending,
            total_items,
            completed_items: 0,
            message: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// A stage is eligible for closure once its counter saturates.
    pub fn is_saturated(&self) -> bool {
        self.total_items > 0 && self.completed_items >= self.total_items
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundJob {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Absent for library-wide orchestrator jobs.
    pub collection_id: Option<CollectionId>,
    pub library_id: Option<LibraryId>,
    /// Id of the message that triggered this run.
    pub message_id: Uuid,
    pub message: Option<String>,
    pub total_items: u64,
    pub completed_items: u64,
    pub progress_percent: u8,
    pub stages: BTreeMap<String, JobStage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackgroundJob {
    pub fn new(kind: JobKind, message_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            kind,
            status: JobStatus::Pending,
            collection_id: None,
            library_id: None,
            message_id,
            message: None,
            total_items: 0,
            completed_items: 0,
            progress_percent: 0,
            stages: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn for_collection(mut self, collection_id: CollectionId) -> Self {
        self.collection_id = Some(collection_id);
        self
    }

    pub fn for_library(mut self, library_id: LibraryId) -> Self {
        self.library_id = Some(library_id);
        self
    }

    /// Seeds a stage with its planned total. Stages must exist before any
    /// producer may increment them; an increment against a missing stage
    /// is silently lost.
    pub fn with_stage(mut self, name: &str, total_items: u64) -> Self {
        self.stages
            .insert(name.to_string(), JobStage::planned(total_items));
        self
    }

    pub fn stage(&self, name: &str) -> Option<&JobStage> {
        self.stages.get(name)
    }

    pub fn all_stages_completed(&self) -> bool {
        !self.stages.is_empty()
            && self
                .stages
                .values()
                .all(|stage| stage.status == StageStatus::Completed)
    }

    pub fn any_stage_failed(&self) -> bool {
        self.stages
            .values()
            .any(|stage| stage.status == StageStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_requires_nonzero_total() {
        let empty = JobStage::planned(0);
        assert!(!empty.is_saturated());

        let mut stage = JobStage::planned(3);
        stage.completed_items = 3;
        assert!(stage.is_saturated());
    }

    #[test]
    fn terminal_closure_needs_every_stage() {
        let mut job = BackgroundJob::new(JobKind::CollectionScan, Uuid::new_v4())
            .with_stage(STAGE_SCAN, 2)
            .with_stage(STAGE_THUMBNAIL, 2);
        assert!(!job.all_stages_completed());

        for stage in job.stages.values_mut() {
            stage.status = StageStatus::Completed;
        }
        assert!(job.all_stages_completed());
        assert!(!job.any_stage_failed());
    }

    #[test]
    fn empty_stage_map_is_never_complete() {
        let job = BackgroundJob::new(JobKind::LibraryScan, Uuid::new_v4());
        assert!(!job.all_stages_completed());
    }
}
