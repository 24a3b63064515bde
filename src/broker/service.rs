use std::collections::VecDeque;

use crate::protocol::Frame;

use super::Identity;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub client: Identity,
    pub body: Vec<Frame>,
}

// Both queues are strictly FIFO: requests in arrival order, workers in the
// order they became idle.
#[derive(Clone, Debug, Default)]
pub struct ServiceEntry {
    name: String,
    pending: VecDeque<PendingRequest>,
    idle: VecDeque<Identity>,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: VecDeque::new(),
            idle: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue_request(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
    }

    pub fn pop_request(&mut self) -> Option<PendingRequest> {
        self.pending.pop_front()
    }

    pub fn push_idle(&mut self, identity: Identity) {
        self.idle.push_back(identity);
    }

    pub fn pop_idle(&mut self) -> Option<Identity> {
        self.idle.pop_front()
    }

    pub fn remove_idle(&mut self, identity: &[u8]) {
        self.idle.retain(|entry| entry != identity);
    }

    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    pub fn is_dispatchable(&self) -> bool {
        !self.pending.is_empty() && !self.idle.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn idle_identities(&self) -> impl Iterator<Item = &[u8]> {
        self.idle.iter().map(|identity| identity.as_slice())
    }
}
