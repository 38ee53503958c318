//! Async bulk-job tracking.
//!
//! Long-running bulk operations register a job, write progress every
//! batch, and finish with a result snapshot. Consumers poll by job id.
//! Progress lives in an in-process map for fast reads and in the
//! `bulk_jobs` collection for persistence.

use chrono::{DateTime, Utc};
use corral_protocol::collections as col;
use corral_protocol::CoreResult;
use corral_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::service::BulkOperationResult;

/// State of one bulk job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJobStatus {
    pub job_id: String,
    /// pending | processing | completed | failed
    pub status: String,
    pub operation: String,
    pub total: u64,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BulkOperationResult>,
}

/// Registry of running and finished bulk jobs.
pub struct BulkJobTracker {
    store: Store,
    jobs: Mutex<HashMap<String, BulkJobStatus>>,
}

impl BulkJobTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a job and return its id.
    pub async fn create_job(
        &self,
        operation: &str,
        total: u64,
        reviewer_id: &str,
    ) -> CoreResult<String> {
        let job_id = format!(
            "bulk_{}_{}_{}",
            operation,
            Utc::now().format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let status = BulkJobStatus {
            job_id: job_id.clone(),
            status: "pending".into(),
            operation: operation.to_string(),
            total,
            processed: 0,
            success: 0,
            failed: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            result: None,
        };

        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), status.clone());

        let mut doc = serde_json::to_value(&status)?;
        doc.as_object_mut()
            .expect("job status serializes to an object")
            .insert("reviewer_id".into(), json!(reviewer_id));
        self.store.create(col::BULK_JOBS, doc).await?;

        Ok(job_id)
    }

    /// Write batch progress; `status` moves to completed/failed at the end.
    pub async fn update_job(
        &self,
        job_id: &str,
        processed: u64,
        success: u64,
        failed: u64,
        status: &str,
        error_message: Option<&str>,
        result: Option<&BulkOperationResult>,
    ) -> CoreResult<()> {
        let finished = matches!(status, "completed" | "failed");
        let completed_at = finished.then(Utc::now);

        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(job_id) {
                job.processed = processed;
                job.success = success;
                job.failed = failed;
                job.status = status.to_string();
                job.completed_at = completed_at;
                if let Some(error_message) = error_message {
                    job.error_message = Some(error_message.to_string());
                }
                if let Some(result) = result {
                    job.result = Some(result.clone());
                }
            }
        }

        let mut set = json!({
            "processed": processed,
            "success": success,
            "failed": failed,
            "status": status,
        });
        if let Some(completed_at) = completed_at {
            set["completed_at"] = json!(completed_at.to_rfc3339());
        }
        if let Some(error_message) = error_message {
            set["error_message"] = json!(error_message);
        }
        if let Some(result) = result {
            set["result"] = serde_json::to_value(result)?;
        }

        self.store
            .update_one(col::BULK_JOBS, &json!({"job_id": job_id}), &json!({"$set": set}))
            .await?;
        Ok(())
    }

    /// Poll a job: the in-process map first, then the store.
    pub async fn job_status(&self, job_id: &str) -> CoreResult<Option<BulkJobStatus>> {
        if let Some(job) = self.jobs.lock().unwrap().get(job_id) {
            return Ok(Some(job.clone()));
        }

        let doc = self
            .store
            .find_one(col::BULK_JOBS, &json!({"job_id": job_id}))
            .await?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }
}
