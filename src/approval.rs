//! Approval Queue
//!
//! Durable queue of outbound posts awaiting human review. Records live in
//! an append-rewritten JSONL file; approval flips the record to `approved`
//! under the lock, the platform call runs outside the lock, and the
//! terminal `posted`/`failed` stamp is written back under the lock again
//! so a slow network call never blocks other reviews.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::storage;
use crate::types::{
    ApprovalAction, ApprovalOutcome, ApprovalRecord, ApprovalStatus, PlatformClient,
};

pub struct ApprovalQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ApprovalQueue {
    pub fn open(storage_dir: &Path) -> Self {
        Self {
            path: storage_dir.join("approvals.jsonl"),
            lock: Mutex::new(()),
        }
    }

    /// Add a new pending record and return its id.
    pub async fn enqueue(
        &self,
        platform: &str,
        action: ApprovalAction,
        text: &str,
        meta: HashMap<String, String>,
    ) -> Result<String, AgentError> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let record = ApprovalRecord {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            platform: platform.to_string(),
            action,
            text: text.to_string(),
            meta,
            status: ApprovalStatus::Pending,
            created_at: now,
            updated_at: now,
            post_id: None,
            error: None,
        };
        storage::append_jsonl(&self.path, &record)
            .map_err(|e| AgentError::InvalidState(format!("approval store write failed: {e:#}")))?;
        info!(id = %record.id, platform, "approval enqueued");
        Ok(record.id)
    }

    /// All records still awaiting review, oldest first.
    pub async fn pending(&self) -> Vec<ApprovalRecord> {
        let _guard = self.lock.lock().await;
        self.read_all()
            .into_iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<ApprovalRecord> {
        let _guard = self.lock.lock().await;
        self.read_all().into_iter().find(|r| r.id == id)
    }

    /// Approve a pending record and execute it against its platform.
    ///
    /// The record is flipped to `approved` before the platform call so a
    /// concurrent reviewer cannot double-execute it; the terminal status is
    /// stamped afterwards.
    pub async fn approve_and_execute(
        &self,
        id: &str,
        clients: &HashMap<String, Arc<dyn PlatformClient>>,
    ) -> Result<ApprovalOutcome, AgentError> {
        let record = {
            let _guard = self.lock.lock().await;
            let mut records = self.read_all();
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| AgentError::InvalidState(format!("no approval with id {id}")))?;
            if record.status != ApprovalStatus::Pending {
                return Err(AgentError::InvalidState(format!(
                    "approval {id} is {:?}, not pending",
                    record.status
                )));
            }
            record.status = ApprovalStatus::Approved;
            record.updated_at = Utc::now();
            let snapshot = record.clone();
            self.write_all(&records)?;
            snapshot
        };

        let result = match clients.get(&record.platform) {
            Some(client) => match record.action {
                ApprovalAction::Post => client.post(&record.text, &record.meta).await,
                ApprovalAction::Reply => {
                    let target = record.meta.get("target_id").cloned().unwrap_or_default();
                    client.reply(&record.text, &target).await
                }
            },
            None => Err(AgentError::external(format!(
                "no executor for platform {}",
                record.platform
            ))),
        };

        let outcome = match result {
            Ok(post) if post.success => ApprovalOutcome {
                success: true,
                post_id: post.post_id,
                error: None,
            },
            Ok(post) => ApprovalOutcome {
                success: false,
                post_id: None,
                error: post.error.or_else(|| Some("post rejected".to_string())),
            },
            Err(e) => ApprovalOutcome {
                success: false,
                post_id: None,
                error: Some(e.to_string()),
            },
        };

        {
            let _guard = self.lock.lock().await;
            let mut records = self.read_all();
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.status = if outcome.success {
                    ApprovalStatus::Posted
                } else {
                    ApprovalStatus::Failed
                };
                record.post_id = outcome.post_id.clone();
                record.error = outcome.error.clone();
                record.updated_at = Utc::now();
                self.write_all(&records)?;
            }
        }

        if outcome.success {
            info!(id, platform = %record.platform, "approval posted");
        } else {
            warn!(id, error = ?outcome.error, "approval execution failed");
        }
        Ok(outcome)
    }

    /// Reject a pending record.
    pub async fn reject(&self, id: &str) -> Result<ApprovalOutcome, AgentError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AgentError::InvalidState(format!("no approval with id {id}")))?;
        if record.status != ApprovalStatus::Pending {
            return Err(AgentError::InvalidState(format!(
                "approval {id} is {:?}, not pending",
                record.status
            )));
        }
        record.status = ApprovalStatus::Rejected;
        record.updated_at = Utc::now();
        self.write_all(&records)?;
        info!(id, "approval rejected");
        Ok(ApprovalOutcome {
            success: true,
            post_id: None,
            error: None,
        })
    }

    fn read_all(&self) -> Vec<ApprovalRecord> {
        match storage::read_jsonl(&self.path) {
            Ok(records) => records,
            Err(e) => {
                warn!("approval store unreadable, treating as empty: {:#}", e);
                Vec::new()
            }
        }
    }

    fn write_all(&self, records: &[ApprovalRecord]) -> Result<(), AgentError> {
        storage::write_jsonl(&self.path, records)
            .map_err(|e| AgentError::InvalidState(format!("approval store write failed: {e:#}")))
    }
}
