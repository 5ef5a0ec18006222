//! In-memory registry of granted exec approvals.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::approval::{ApprovalBinding, ExecApprovalRequest, approval_matches_for_host};

/// How long a grant stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    /// Consumed by the first matching request.
    AllowOnce,
    /// Reusable until it expires or is revoked.
    AllowAlways,
}

/// A granted approval with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub request: ExecApprovalRequest,
    pub decision: ApprovalDecision,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    /// Returns `true` if the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// Thread-safe store of approval records for one execution context.
#[derive(Debug, Default)]
pub struct ApprovalRegistry {
    records: RwLock<HashMap<Uuid, ApprovalRecord>>,
}

impl ApprovalRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a grant and returns its id.
    ///
    /// With a `ttl`, the record expires that long after now. A `ttl` too large
    /// to represent as a timestamp never expires.
    #[instrument(skip(self, request), fields(host = %request.host, decision = ?decision))]
    pub fn grant(
        &self,
        request: ExecApprovalRequest,
        decision: ApprovalDecision,
        ttl: Option<Duration>,
    ) -> Uuid {
        let created_at = Utc::now();
        let record = ApprovalRecord {
            id: Uuid::new_v4(),
            request,
            decision,
            created_at,
            expires_at: ttl.and_then(|ttl| created_at.checked_add_signed(ttl)),
        };
        let id = record.id;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record);
        debug!(%id, "Granted exec approval");
        id
    }

    /// Inserts an existing record, e.g. one restored by a collaborator.
    pub fn insert(&self, record: ApprovalRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);
    }

    /// Finds a live record matching the invocation exactly.
    ///
    /// Expired records are dropped first. A matching allow-once record is
    /// removed before it is returned, so it can authorize only one request.
    #[instrument(skip_all, fields(host = %host))]
    pub fn find_match<S: AsRef<str>>(
        &self,
        cmd_text: &str,
        argv: &[S],
        binding: &ApprovalBinding,
        host: &str,
        now: DateTime<Utc>,
    ) -> Option<ApprovalRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        if records.len() < before {
            debug!(pruned = before - records.len(), "Dropped expired approvals");
        }

        let mut candidates: Vec<&ApprovalRecord> = records
            .values()
            .filter(|r| approval_matches_for_host(host, cmd_text, argv, &r.request, binding))
            .collect();
        // Prefer reusable grants so allow-once records are kept for later.
        candidates.sort_by_key(|r| (r.decision == ApprovalDecision::AllowOnce, r.created_at));
        let record = candidates.first().map(|r| (*r).clone())?;

        if record.decision == ApprovalDecision::AllowOnce {
            records.remove(&record.id);
            debug!(id = %record.id, "Consumed allow-once approval");
        } else {
            debug!(id = %record.id, "Matched approval");
        }
        Some(record)
    }

    /// Removes a record. Returns `true` if it existed.
    pub fn revoke(&self, id: Uuid) -> bool {
        let removed = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(%id, "Revoked approval");
        }
        removed
    }

    /// Drops expired records and returns how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        before - records.len()
    }

    /// Returns a copy of a record.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<ApprovalRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
