//! Credential pool with health-based selection.
//!
//! Every credential carries success/error counters. Selection prefers the
//! highest `success - error` balance and breaks ties on the lower error
//! count. Credentials leave the active set when a quota failure is reported
//! or when their error count passes [`MAX_CREDENTIAL_ERRORS`]; they never come
//! back within a run. A key reload may only add tokens that were never seen
//! before, and only after a fresh probe succeeds.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::service::{FailureKind, GenerativeService};

/// Errors above this count retire a credential.
pub const MAX_CREDENTIAL_ERRORS: u32 = 5;

/// Index of a credential inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialId(usize);

/// Result of one call, as reported back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call produced a response.
    Success,
    /// The call failed; the kind decides how the pool reacts.
    Failure(FailureKind),
}

/// Token handed to the orchestrator for a single call.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    /// Pool slot to report the outcome against.
    pub id: CredentialId,
    /// Secret token for the service.
    pub token: String,
    /// Masked label, safe for logs.
    pub label: String,
}

#[derive(Debug, Clone)]
struct CredentialState {
    token: String,
    label: String,
    success_count: u32,
    error_count: u32,
    quota_exceeded: bool,
    last_used: Option<DateTime<Utc>>,
}

impl CredentialState {
    fn new(token: String) -> Self {
        let label = mask(&token);
        Self {
            token,
            label,
            success_count: 0,
            error_count: 0,
            quota_exceeded: false,
            last_used: None,
        }
    }

    fn is_active(&self) -> bool {
        !self.quota_exceeded && self.error_count <= MAX_CREDENTIAL_ERRORS
    }

    fn balance(&self) -> i64 {
        i64::from(self.success_count) - i64::from(self.error_count)
    }
}

/// Snapshot of one credential's counters for the final report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialHealth {
    /// Masked token label.
    pub label: String,
    /// Successful calls.
    pub success_count: u32,
    /// Failed non-quota calls, unauthorized ones included.
    pub error_count: u32,
    /// Whether a quota failure retired the credential.
    pub quota_exceeded: bool,
    /// Whether the credential is still selectable.
    pub active: bool,
    /// Last time the credential was leased.
    pub last_used: Option<DateTime<Utc>>,
}

/// Owns the credentials and all mutation of their counters.
#[derive(Debug, Default)]
pub struct CredentialPool {
    credentials: Vec<CredentialState>,
    seen: HashSet<String>,
}

impl CredentialPool {
    /// Builds a pool from tokens trusted without probing.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pool = Self::default();
        for token in tokens {
            pool.insert(token.into());
        }
        pool
    }

    /// Builds a pool admitting only tokens whose probe succeeds.
    pub async fn probed<S: GenerativeService + ?Sized>(service: &S, tokens: &[String]) -> Self {
        let mut pool = Self::default();
        pool.admit_probed(service, tokens).await;
        pool
    }

    fn insert(&mut self, token: String) -> bool {
        if !self.seen.insert(token.clone()) {
            return false;
        }
        self.credentials.push(CredentialState::new(token));
        true
    }

    /// Probes and admits tokens this pool has never seen; returns how many joined.
    pub async fn admit_probed<S: GenerativeService + ?Sized>(
        &mut self,
        service: &S,
        tokens: &[String],
    ) -> usize {
        let mut added = 0;
        for token in tokens {
            if self.seen.contains(token) {
                continue;
            }
            let label = mask(token);
            match service.probe(token).await {
                Ok(()) => {
                    self.insert(token.clone());
                    added += 1;
                    info!(credential = %label, "credential passed probe and joined the pool");
                }
                Err(err) => {
                    // Failed probes still count as seen so a later reload does not retry them.
                    self.seen.insert(token.clone());
                    warn!(credential = %label, error = %err, "credential probe failed");
                }
            }
        }
        added
    }

    /// Picks the healthiest active credential, or `None` when the pool is exhausted.
    pub fn select(&mut self) -> Option<CredentialLease> {
        let (index, state) = self
            .credentials
            .iter_mut()
            .enumerate()
            .filter(|(_, state)| state.is_active())
            .min_by(|(ia, a), (ib, b)| {
                b.balance()
                    .cmp(&a.balance())
                    .then(a.error_count.cmp(&b.error_count))
                    .then(ia.cmp(ib))
            })?;
        state.last_used = Some(Utc::now());
        debug!(
            credential = %state.label,
            success = state.success_count,
            errors = state.error_count,
            "credential selected"
        );
        Some(CredentialLease {
            id: CredentialId(index),
            token: state.token.clone(),
            label: state.label.clone(),
        })
    }

    /// Records a call outcome against a credential.
    pub fn report(&mut self, id: CredentialId, outcome: CallOutcome) {
        let Some(state) = self.credentials.get_mut(id.0) else {
            return;
        };
        match outcome {
            CallOutcome::Success => state.success_count += 1,
            CallOutcome::Failure(FailureKind::Quota) => {
                if !state.quota_exceeded {
                    warn!(credential = %state.label, "quota exceeded, credential retired");
                }
                state.quota_exceeded = true;
            }
            CallOutcome::Failure(_) => {
                state.error_count += 1;
                if state.error_count == MAX_CREDENTIAL_ERRORS + 1 {
                    warn!(
                        credential = %state.label,
                        errors = state.error_count,
                        "too many errors, credential retired"
                    );
                }
            }
        }
    }

    /// Number of selectable credentials.
    pub fn active_count(&self) -> usize {
        self.credentials.iter().filter(|s| s.is_active()).count()
    }

    /// Number of credentials ever admitted.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Whether no credential was ever admitted.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Counters of every admitted credential, in admission order.
    pub fn health(&self) -> Vec<CredentialHealth> {
        self.credentials
            .iter()
            .map(|state| CredentialHealth {
                label: state.label.clone(),
                success_count: state.success_count,
                error_count: state.error_count,
                quota_exceeded: state.quota_exceeded,
                active: state.is_active(),
                last_used: state.last_used,
            })
            .collect()
    }
}

/// Masks a token down to a log-safe prefix.
pub fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{prefix}...")
}
