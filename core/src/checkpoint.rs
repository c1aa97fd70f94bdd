//! Batch-ingestion checkpoint models (§3, §4.2). Ported in meaning from
//! `original_source/src/domain/models/checkpoint.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Converting,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("path must be non-empty")]
    EmptyPath,
    #[error("chunks_count must be >= 0")]
    NegativeChunksCount,
    #[error("doc_id must be non-empty when marking completed")]
    EmptyDocId,
    #[error("error must be non-empty when marking failed")]
    EmptyError,
    #[error("status is 'failed' but no error text was supplied")]
    FailedWithoutError,
    #[error("correlation_id must be non-empty")]
    EmptyCorrelationId,
    #[error("correlation_id must be a valid UUID (>= 36 chars), got: {0}")]
    InvalidCorrelationId(String),
    #[error("project_id must be non-empty")]
    EmptyProjectId,
    #[error("last_update cannot be before start_time")]
    UpdateBeforeStart,
    #[error(
        "statistics inconsistent: completed={completed}, failed={failed}, pending={pending} does not sum to total={total}"
    )]
    StatisticsInconsistent {
        total: u64,
        completed: u64,
        failed: u64,
        pending: u64,
    },
}

impl crate::error::CiteloomError for CheckpointError {
    fn error_code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::InvalidArgument
    }
}

/// Aggregated completion statistics for a batch, recomputed after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStatistics {
    pub total_documents: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

impl CheckpointStatistics {
    pub fn from_counts(total: u64, completed: u64, failed: u64, pending: u64) -> Result<Self, CheckpointError> {
        if completed + failed + pending != total {
            return Err(CheckpointError::StatisticsInconsistent {
                total,
                completed,
                failed,
                pending,
            });
        }
        Ok(Self {
            total_documents: total,
            completed,
            failed,
            pending,
        })
    }

    /// 0.0 to 1.0. An empty batch is trivially "100% complete".
    pub fn completion_percentage(&self) -> f64 {
        if self.total_documents == 0 {
            return 1.0;
        }
        (self.completed + self.failed) as f64 / self.total_documents as f64
    }
}

/// State of a single document within a batch ingestion run (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCheckpoint {
    pub path: String,
    pub status: Stage,
    /// Mirrors `status` while active. Per the resolved Open Question in DESIGN.md,
    /// `mark_completed` sets this to `Some(Stage::Storing)` rather than clearing it,
    /// since completion is itself the final transition out of the storing stage;
    /// only `mark_failed` clears it to `None`.
    pub stage: Option<Stage>,
    pub chunks_count: u64,
    pub doc_id: Option<String>,
    pub zotero_item_key: Option<String>,
    pub zotero_attachment_key: Option<String>,
    pub error: Option<String>,
    /// Last page fully processed for a windowed (very large PDF) conversion;
    /// `None` for documents short enough to process in one pass. Lets a
    /// resumed run skip windows already embedded and upserted (§4.12).
    #[serde(default)]
    pub window_checkpoint: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentCheckpoint {
    pub fn new(path: String, now: DateTime<Utc>) -> Result<Self, CheckpointError> {
        if path.is_empty() {
            return Err(CheckpointError::EmptyPath);
        }
        Ok(Self {
            path,
            status: Stage::Pending,
            stage: None,
            chunks_count: 0,
            doc_id: None,
            zotero_item_key: None,
            zotero_attachment_key: None,
            error: None,
            window_checkpoint: None,
            updated_at: now,
        })
    }

    pub fn mark_stage(&mut self, stage: Stage, now: DateTime<Utc>) {
        self.status = stage;
        self.stage = Some(stage);
        self.updated_at = now;
    }

    /// Records that every page up to and including `through_page` has been
    /// chunked, embedded, and upserted for a windowed conversion.
    pub fn mark_window_progress(&mut self, through_page: u32, now: DateTime<Utc>) {
        self.window_checkpoint = Some(through_page);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, chunks_count: u64, doc_id: String, now: DateTime<Utc>) -> Result<(), CheckpointError> {
        if doc_id.is_empty() {
            return Err(CheckpointError::EmptyDocId);
        }
        self.status = Stage::Completed;
        self.stage = Some(Stage::Storing);
        self.chunks_count = chunks_count;
        self.doc_id = Some(doc_id);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> Result<(), CheckpointError> {
        if error.is_empty() {
            return Err(CheckpointError::EmptyError);
        }
        self.status = Stage::Failed;
        self.stage = None;
        self.error = Some(error);
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, Stage::Completed | Stage::Failed)
    }

    fn validate(&self) -> Result<(), CheckpointError> {
        if self.path.is_empty() {
            return Err(CheckpointError::EmptyPath);
        }
        if self.status == Stage::Failed && self.error.as_deref().unwrap_or("").is_empty() {
            return Err(CheckpointError::FailedWithoutError);
        }
        Ok(())
    }
}

/// Durable, resumable record of a batch ingestion run, keyed by `correlation_id` (§3, §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionCheckpoint {
    pub correlation_id: String,
    pub project_id: String,
    pub collection_key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub documents: Vec<DocumentCheckpoint>,
    pub statistics: CheckpointStatistics,
}

impl IngestionCheckpoint {
    pub fn new(
        correlation_id: String,
        project_id: String,
        collection_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, CheckpointError> {
        if correlation_id.is_empty() {
            return Err(CheckpointError::EmptyCorrelationId);
        }
        if correlation_id.len() < 36 {
            return Err(CheckpointError::InvalidCorrelationId(correlation_id));
        }
        if project_id.is_empty() {
            return Err(CheckpointError::EmptyProjectId);
        }
        Ok(Self {
            correlation_id,
            project_id,
            collection_key,
            start_time: now,
            last_update: now,
            documents: Vec::new(),
            statistics: CheckpointStatistics::from_counts(0, 0, 0, 0)?,
        })
    }

    /// Replaces an existing document checkpoint with the same path, or appends.
    pub fn add_document_checkpoint(&mut self, doc: DocumentCheckpoint, now: DateTime<Utc>) -> Result<(), CheckpointError> {
        if let Some(existing) = self.documents.iter_mut().find(|d| d.path == doc.path) {
            *existing = doc;
        } else {
            self.documents.push(doc);
        }
        self.update_statistics(now)
    }

    pub fn get_incomplete_documents(&self) -> Vec<&DocumentCheckpoint> {
        self.documents.iter().filter(|d| !d.is_terminal()).collect()
    }

    pub fn get_completed_documents(&self) -> Vec<&DocumentCheckpoint> {
        self.documents.iter().filter(|d| d.status == Stage::Completed).collect()
    }

    pub fn update_statistics(&mut self, now: DateTime<Utc>) -> Result<(), CheckpointError> {
        let total = self.documents.len() as u64;
        let completed = self.documents.iter().filter(|d| d.status == Stage::Completed).count() as u64;
        let failed = self.documents.iter().filter(|d| d.status == Stage::Failed).count() as u64;
        let pending = total - completed - failed;
        self.statistics = CheckpointStatistics::from_counts(total, completed, failed, pending)?;
        self.last_update = now;
        Ok(())
    }

    /// Full validation per §4.2: non-empty ids, ordered timestamps, valid documents,
    /// and statistics that match a fresh recomputation.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.correlation_id.is_empty() {
            return Err(CheckpointError::EmptyCorrelationId);
        }
        if self.correlation_id.len() < 36 {
            return Err(CheckpointError::InvalidCorrelationId(self.correlation_id.clone()));
        }
        if self.project_id.is_empty() {
            return Err(CheckpointError::EmptyProjectId);
        }
        if self.start_time > self.last_update {
            return Err(CheckpointError::UpdateBeforeStart);
        }
        for doc in &self.documents {
            doc.validate()?;
        }
        let total = self.documents.len() as u64;
        let completed = self.documents.iter().filter(|d| d.status == Stage::Completed).count() as u64;
        let failed = self.documents.iter().filter(|d| d.status == Stage::Failed).count() as u64;
        let pending = total - completed - failed;
        let recomputed = CheckpointStatistics::from_counts(total, completed, failed, pending)?;
        if recomputed != self.statistics {
            return Err(CheckpointError::StatisticsInconsistent {
                total,
                completed,
                failed,
                pending,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn mark_completed_sets_stage_to_storing_not_none() {
        let mut doc = DocumentCheckpoint::new("/a.pdf".to_string(), now()).unwrap();
        doc.mark_stage(Stage::Converting, now());
        doc.mark_completed(3, "doc-1".to_string(), now()).unwrap();
        assert_eq!(doc.status, Stage::Completed);
        assert_eq!(doc.stage, Some(Stage::Storing));
    }

    #[test]
    fn mark_failed_clears_stage() {
        let mut doc = DocumentCheckpoint::new("/a.pdf".to_string(), now()).unwrap();
        doc.mark_stage(Stage::Converting, now());
        doc.mark_failed("boom".to_string(), now()).unwrap();
        assert_eq!(doc.status, Stage::Failed);
        assert_eq!(doc.stage, None);
    }

    #[test]
    fn statistics_recompute_on_add() {
        let mut ckpt = IngestionCheckpoint::new(
            "11111111-1111-1111-1111-111111111111".to_string(),
            "proj/x".to_string(),
            None,
            now(),
        )
        .unwrap();
        let mut doc = DocumentCheckpoint::new("/a.pdf".to_string(), now()).unwrap();
        ckpt.add_document_checkpoint(doc.clone(), now()).unwrap();
        assert_eq!(ckpt.statistics.pending, 1);
        doc.mark_completed(5, "doc-1".to_string(), now()).unwrap();
        ckpt.add_document_checkpoint(doc, now()).unwrap();
        assert_eq!(ckpt.statistics.completed, 1);
        assert_eq!(ckpt.statistics.pending, 0);
        assert_eq!(ckpt.documents.len(), 1, "same path replaces in place");
    }

    #[test]
    fn validate_catches_tampered_statistics() {
        let mut ckpt = IngestionCheckpoint::new(
            "11111111-1111-1111-1111-111111111111".to_string(),
            "proj/x".to_string(),
            None,
            now(),
        )
        .unwrap();
        let doc = DocumentCheckpoint::new("/a.pdf".to_string(), now()).unwrap();
        ckpt.add_document_checkpoint(doc, now()).unwrap();
        ckpt.statistics = CheckpointStatistics::from_counts(1, 1, 0, 0).unwrap();
        assert!(ckpt.validate().is_err());
    }
}
