use chrono::{DateTime, Utc};

use super::Identity;

// Explicit lifecycle tag. Idle must stay in lock-step with list membership:
// a worker is Idle iff it sits in its service's idle list and the broker's
// global idle list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Unregistered,
    Idle,
    Busy,
}

#[derive(Clone, Debug)]
pub struct WorkerEntry {
    identity: Identity,
    service: Option<String>,
    expiry: DateTime<Utc>,
    state: WorkerState,
}

impl WorkerEntry {
    pub fn new(identity: Identity, expiry: DateTime<Utc>) -> Self {
        Self {
            identity,
            service: None,
            expiry,
            state: WorkerState::Unregistered,
        }
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.service.is_some()
    }

    pub fn register(&mut self, service: impl Into<String>) {
        self.service = Some(service.into());
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn refresh_expiry(&mut self, expiry: DateTime<Utc>) {
        self.expiry = expiry;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    pub fn mark_idle(&mut self) {
        self.state = WorkerState::Idle;
    }

    pub fn mark_busy(&mut self) {
        self.state = WorkerState::Busy;
    }
}
