//! Human-approval records and collaborator traits.
//!
//! The engine only defines the record shape and polls it; persistence and
//! notification delivery belong to external collaborators. Writes are
//! last-write-wins.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Approval lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// An approval request, remotely mutable through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Unique record ID.
    pub id: Uuid,
    /// Workflow name the request belongs to.
    pub workflow: String,
    /// Wait point name the request belongs to.
    pub step: String,
    /// Current status.
    pub status: ApprovalStatus,
    /// Message shown to approvers.
    pub message: String,
    /// Identities allowed to approve.
    pub approvers: Vec<String>,
    /// Identity that resolved the request.
    pub resolved_by: Option<String>,
    /// Expiry deadline, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Escalation target set when a timeout escalates.
    pub escalated_to: Option<String>,
    /// Last reminder time.
    pub reminded_at: Option<DateTime<Utc>>,
    /// Number of reminders sent.
    pub reminder_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn new(
        workflow: impl Into<String>,
        step: impl Into<String>,
        message: impl Into<String>,
        approvers: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.into(),
            step: step.into(),
            status: ApprovalStatus::Pending,
            message: message.into(),
            approvers,
            resolved_by: None,
            expires_at: None,
            escalated_to: None,
            reminded_at: None,
            reminder_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn approve(&mut self, by: impl Into<String>) {
        self.status = ApprovalStatus::Approved;
        self.resolved_by = Some(by.into());
        self.touch();
    }

    pub fn reject(&mut self, by: impl Into<String>) {
        self.status = ApprovalStatus::Rejected;
        self.resolved_by = Some(by.into());
        self.touch();
    }

    pub fn expire(&mut self) {
        self.status = ApprovalStatus::Expired;
        self.touch();
    }

    pub fn mark_reminded(&mut self) {
        self.reminded_at = Some(Utc::now());
        self.reminder_count += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persistence collaborator for approval records.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn save(&self, record: &ApprovalRecord) -> Result<(), ExecutionError>;
    async fn find(&self, id: Uuid) -> Result<Option<ApprovalRecord>, ExecutionError>;
}

/// Notification collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send the initial notification; returns per-channel delivery results.
    async fn notify(
        &self,
        record: &ApprovalRecord,
        message: &str,
        channels: &[String],
    ) -> HashMap<String, bool>;

    /// Send a reminder for a still-pending request.
    async fn remind(&self, record: &ApprovalRecord, message: &str);
}

/// In-memory approval store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryApprovalStore {
    records: RwLock<HashMap<Uuid, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored record in place (test helper for simulating a
    /// remote approver).
    pub fn update<F: FnOnce(&mut ApprovalRecord)>(&self, id: Uuid, f: F) -> bool {
        let mut records = self.records.write();
        match records.get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn save(&self, record: &ApprovalRecord) -> Result<(), ExecutionError> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<ApprovalRecord>, ExecutionError> {
        Ok(self.records.read().get(&id).cloned())
    }
}
