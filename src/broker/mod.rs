pub mod service;
pub mod worker;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::heartbeat::HeartbeatSchedule;
use crate::logging::{LogLevel, Logger};
use crate::protocol::{
    display_identity, is_reserved_service, Frame, Message, WorkerCommand, CLIENT_HEADER,
    MMI_SERVICE_QUERY, MMI_STATUS_FOUND, MMI_STATUS_NOT_FOUND, MMI_STATUS_NOT_IMPLEMENTED,
    WORKER_HEADER,
};
use crate::wire::session::{classify_message, InboundAction};

use self::service::{PendingRequest, ServiceEntry};
use self::worker::{WorkerEntry, WorkerState};

pub type Identity = Vec<u8>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub identity: Identity,
    pub frames: Message,
}

// All broker state lives here and is mutated from a single reactor thread;
// there is deliberately no interior locking.
pub struct Broker {
    services: HashMap<String, ServiceEntry>,
    workers: HashMap<Identity, WorkerEntry>,
    waiting: VecDeque<Identity>,
    schedule: HeartbeatSchedule,
}

impl Broker {
    pub fn new(schedule: HeartbeatSchedule) -> Self {
        Self {
            services: HashMap::new(),
            workers: HashMap::new(),
            waiting: VecDeque::new(),
            schedule,
        }
    }

    pub fn heartbeat_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_due(now)
    }

    pub fn next_heartbeat_at(&self) -> DateTime<Utc> {
        self.schedule.next_at()
    }

    pub fn handle_message(
        &mut self,
        now: DateTime<Utc>,
        sender: &[u8],
        frames: Message,
        logger: &Logger,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();

        match classify_message(frames) {
            Ok(InboundAction::ClientRequest { service, body }) => {
                self.handle_client_request(now, sender, service, body, &mut out, logger);
            }
            Ok(InboundAction::WorkerReady { service }) => {
                self.require_worker(sender, now);
                self.handle_worker_ready(now, sender, service, &mut out, logger);
            }
            Ok(InboundAction::WorkerReply { client, body }) => {
                self.require_worker(sender, now);
                self.handle_worker_reply(now, sender, client, body, &mut out, logger);
            }
            Ok(InboundAction::WorkerHeartbeat) => {
                self.require_worker(sender, now);
                self.handle_worker_heartbeat(now, sender, &mut out, logger);
            }
            Ok(InboundAction::WorkerDisconnect) => {
                self.delete_worker(sender, false, &mut out, logger);
            }
            Err(error) => {
                logger.warn(
                    Some("broker"),
                    &format!(
                        "dropping message from {}: {error}",
                        display_identity(sender)
                    ),
                );
            }
        }

        out
    }

    // Periodic sweep: evict expired workers, then heartbeat everyone still
    // idle, then schedule the next sweep.
    pub fn tick(&mut self, now: DateTime<Utc>, logger: &Logger) -> Vec<Outbound> {
        let mut out = Vec::new();

        self.purge(now, &mut out, logger);
        for identity in &self.waiting {
            out.push(worker_message(identity, WorkerCommand::Heartbeat, Vec::new()));
        }
        logger.verbose(
            Some("broker::heartbeat"),
            &format!("sent HEARTBEAT to {} idle workers", self.waiting.len()),
        );
        self.schedule.advance(now);

        out
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_state(&self, identity: &[u8]) -> Option<WorkerState> {
        self.workers.get(identity).map(WorkerEntry::state)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn global_idle_identities(&self) -> Vec<&[u8]> {
        self.waiting.iter().map(|identity| identity.as_slice()).collect()
    }

    fn handle_client_request(
        &mut self,
        now: DateTime<Utc>,
        sender: &[u8],
        service: String,
        body: Vec<Frame>,
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        if is_reserved_service(&service) {
            self.answer_mmi(sender, service, body, out, logger);
            return;
        }

        logger.log(
            LogLevel::Verbose,
            Some("broker::client"),
            "request enqueued",
            Some(json!({
                "service": service,
                "client": display_identity(sender),
                "body_frames": body.len()
            })),
        );

        self.service_entry(&service).enqueue_request(PendingRequest {
            client: sender.to_vec(),
            body,
        });
        self.dispatch(&service, now, out, logger);
    }

    fn answer_mmi(
        &mut self,
        sender: &[u8],
        service: String,
        mut body: Vec<Frame>,
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        let status: &[u8] = if service == MMI_SERVICE_QUERY {
            let target = body
                .last()
                .and_then(|frame| std::str::from_utf8(frame).ok());
            match target {
                Some(name) if self.services.get(name).is_some_and(ServiceEntry::has_idle) => {
                    MMI_STATUS_FOUND
                }
                _ => MMI_STATUS_NOT_FOUND,
            }
        } else {
            MMI_STATUS_NOT_IMPLEMENTED
        };

        logger.log(
            LogLevel::Verbose,
            Some("broker::mmi"),
            "management query answered",
            Some(json!({
                "service": service,
                "status": String::from_utf8_lossy(status)
            })),
        );

        // The status code replaces the final payload frame; everything else
        // echoes back unchanged.
        body.pop();
        body.push(status.to_vec());
        out.push(client_message(sender, &service, body));
    }

    fn handle_worker_ready(
        &mut self,
        now: DateTime<Utc>,
        sender: &[u8],
        service: String,
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        let already_registered = self
            .workers
            .get(sender)
            .map(WorkerEntry::is_registered)
            .unwrap_or(false);

        if already_registered || is_reserved_service(&service) {
            logger.warn(
                Some("broker::worker"),
                &format!(
                    "invalid READY for '{service}' from {}, disconnecting",
                    display_identity(sender)
                ),
            );
            self.delete_worker(sender, true, out, logger);
            return;
        }

        if let Some(entry) = self.workers.get_mut(sender) {
            entry.register(service.clone());
        }
        logger.log(
            LogLevel::Debug,
            Some("broker::worker"),
            "worker registered",
            Some(json!({
                "service": service,
                "worker": display_identity(sender)
            })),
        );
        self.worker_idle(now, sender, out, logger);
    }

    fn handle_worker_reply(
        &mut self,
        now: DateTime<Utc>,
        sender: &[u8],
        client: Frame,
        body: Vec<Frame>,
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        let service = self
            .workers
            .get(sender)
            .and_then(|entry| entry.service().map(str::to_owned));

        let Some(service) = service else {
            logger.warn(
                Some("broker::worker"),
                &format!(
                    "REPLY from unregistered worker {}, disconnecting",
                    display_identity(sender)
                ),
            );
            self.delete_worker(sender, true, out, logger);
            return;
        };

        logger.log(
            LogLevel::Verbose,
            Some("broker::worker"),
            "reply forwarded",
            Some(json!({
                "service": service,
                "worker": display_identity(sender),
                "client": display_identity(&client)
            })),
        );
        out.push(client_message(&client, &service, body));
        self.worker_idle(now, sender, out, logger);
    }

    fn handle_worker_heartbeat(
        &mut self,
        now: DateTime<Utc>,
        sender: &[u8],
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        let expiry = self.schedule.expiry_for(now);
        match self.workers.get_mut(sender) {
            Some(entry) if entry.is_registered() => entry.refresh_expiry(expiry),
            _ => {
                logger.warn(
                    Some("broker::worker"),
                    &format!(
                        "HEARTBEAT from unregistered worker {}, disconnecting",
                        display_identity(sender)
                    ),
                );
                self.delete_worker(sender, true, out, logger);
            }
        }
    }

    fn require_worker(&mut self, sender: &[u8], now: DateTime<Utc>) {
        if !self.workers.contains_key(sender) {
            let expiry = self.schedule.expiry_for(now);
            self.workers
                .insert(sender.to_vec(), WorkerEntry::new(sender.to_vec(), expiry));
        }
    }

    fn service_entry(&mut self, name: &str) -> &mut ServiceEntry {
        self.services
            .entry(name.to_owned())
            .or_insert_with(|| ServiceEntry::new(name))
    }

    // Removes the worker from its service idle list, the global idle list,
    // and the registry. Deleting an unknown identity is a no-op.
    fn delete_worker(
        &mut self,
        identity: &[u8],
        send_disconnect: bool,
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        let Some(entry) = self.workers.remove(identity) else {
            return;
        };

        if send_disconnect {
            out.push(worker_message(identity, WorkerCommand::Disconnect, Vec::new()));
        }

        if let Some(service) = entry.service() {
            if let Some(service_entry) = self.services.get_mut(service) {
                service_entry.remove_idle(identity);
            }
        }
        self.waiting.retain(|waiting| waiting != identity);

        logger.log(
            LogLevel::Debug,
            Some("broker::worker"),
            "worker deleted",
            Some(json!({
                "worker": display_identity(identity),
                "service": entry.service(),
                "disconnect_sent": send_disconnect
            })),
        );
    }

    // Appends the worker to both idle lists, refreshes its liveness expiry,
    // and immediately tries to pair it with queued work.
    fn worker_idle(
        &mut self,
        now: DateTime<Utc>,
        identity: &[u8],
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        let expiry = self.schedule.expiry_for(now);
        let service = match self.workers.get_mut(identity) {
            Some(entry) if entry.is_registered() => {
                entry.mark_idle();
                entry.refresh_expiry(expiry);
                entry.service().map(str::to_owned)
            }
            _ => None,
        };

        let Some(service) = service else {
            return;
        };

        self.service_entry(&service).push_idle(identity.to_vec());
        self.waiting.push_back(identity.to_vec());
        self.dispatch(&service, now, out, logger);
    }

    // Pairs the oldest idle worker with the oldest pending request until one
    // queue runs dry. Stale workers are purged first so they are never
    // selected.
    fn dispatch(
        &mut self,
        service: &str,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound>,
        logger: &Logger,
    ) {
        self.purge(now, out, logger);

        loop {
            let Some(entry) = self.services.get_mut(service) else {
                return;
            };
            if !entry.is_dispatchable() {
                return;
            }

            let (identity, request) = match (entry.pop_idle(), entry.pop_request()) {
                (Some(identity), Some(request)) => (identity, request),
                _ => return,
            };

            self.waiting.retain(|waiting| waiting != &identity);
            if let Some(worker) = self.workers.get_mut(&identity) {
                worker.mark_busy();
            }

            logger.log(
                LogLevel::Verbose,
                Some("broker::dispatch"),
                "request paired with worker",
                Some(json!({
                    "service": service,
                    "worker": display_identity(&identity),
                    "client": display_identity(&request.client)
                })),
            );

            let mut tail = vec![request.client, Vec::new()];
            tail.extend(request.body);
            out.push(worker_message(&identity, WorkerCommand::Request, tail));
        }
    }

    // The global idle list is oldest-first and the liveness window constant,
    // so expiries are non-decreasing along it; scanning stops at the first
    // live worker.
    fn purge(&mut self, now: DateTime<Utc>, out: &mut Vec<Outbound>, logger: &Logger) {
        while let Some(front) = self.waiting.front() {
            match self.workers.get(front) {
                Some(entry) if !entry.is_expired(now) => break,
                Some(_) => {
                    let identity = front.clone();
                    logger.log(
                        LogLevel::Debug,
                        Some("broker::purge"),
                        "expired worker evicted",
                        Some(json!({"worker": display_identity(&identity)})),
                    );
                    self.delete_worker(&identity, false, out, logger);
                }
                None => {
                    self.waiting.pop_front();
                }
            }
        }
    }
}

fn worker_message(identity: &[u8], command: WorkerCommand, tail: Vec<Frame>) -> Outbound {
    let mut frames = vec![
        identity.to_vec(),
        Vec::new(),
        WORKER_HEADER.to_vec(),
        command.as_frame(),
    ];
    frames.extend(tail);
    Outbound {
        identity: identity.to_vec(),
        frames,
    }
}

fn client_message(client: &[u8], service: &str, body: Vec<Frame>) -> Outbound {
    let mut frames = vec![
        client.to_vec(),
        Vec::new(),
        CLIENT_HEADER.to_vec(),
        service.as_bytes().to_vec(),
    ];
    frames.extend(body);
    Outbound {
        identity: client.to_vec(),
        frames,
    }
}
