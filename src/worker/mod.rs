use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::{unwrap_envelope, Frame, Message, WorkerCommand, WORKER_HEADER};
use crate::wire::codec::{self, CodecError};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2_500);
pub const DEFAULT_LIVENESS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2_500);

#[derive(Clone, Copy, Debug)]
pub struct WorkerOptions {
    pub heartbeat_interval: Duration,
    pub liveness: u32,
    pub reconnect_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness: DEFAULT_LIVENESS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug)]
pub enum WorkerError {
    Connect { address: String, source: io::Error },
    ConfigureStream { source: io::Error },
    InvalidLiveness,
    Codec(CodecError),
    MalformedRequest,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to broker at {address}: {source}")
            }
            Self::ConfigureStream { source } => {
                write!(f, "failed to configure worker stream: {source}")
            }
            Self::InvalidLiveness => write!(f, "worker liveness must be at least 1"),
            Self::Codec(source) => write!(f, "worker wire error: {source}"),
            Self::MalformedRequest => {
                write!(f, "REQUEST from broker is missing the client envelope")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkRequest {
    pub client: Frame,
    pub body: Vec<Frame>,
}

enum BrokerEvent {
    Request(WorkRequest),
    Heartbeat,
    Disconnect,
    Ignored,
}

// Blocking worker-side wrapper: READY on connect, one REQUEST at a time,
// HEARTBEAT on an interval shorter than the broker's liveness window. A
// broker that goes silent or sends DISCONNECT is handled by reconnecting
// with a fresh READY.
#[derive(Debug)]
pub struct ServiceWorker {
    address: String,
    service: String,
    options: WorkerOptions,
    stream: TcpStream,
    liveness_remaining: u32,
    heartbeat_at: Instant,
}

impl ServiceWorker {
    pub fn connect(address: &str, service: &str) -> Result<Self, WorkerError> {
        Self::connect_with_options(address, service, WorkerOptions::default())
    }

    pub fn connect_with_options(
        address: &str,
        service: &str,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        if options.liveness == 0 {
            return Err(WorkerError::InvalidLiveness);
        }

        let mut stream = open_stream(address, options.heartbeat_interval)?;
        send_ready(&mut stream, service)?;

        Ok(Self {
            address: address.to_owned(),
            service: service.to_owned(),
            options,
            stream,
            liveness_remaining: options.liveness,
            heartbeat_at: Instant::now() + options.heartbeat_interval,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    // One poll step: waits up to one heartbeat interval for broker traffic,
    // keeps the heartbeat and liveness bookkeeping moving, and hands back a
    // request when one arrives.
    pub fn poll(&mut self) -> Result<Option<WorkRequest>, WorkerError> {
        match codec::read_message(&mut self.stream) {
            Ok(frames) => {
                self.liveness_remaining = self.options.liveness;
                match parse_broker_event(frames)? {
                    BrokerEvent::Request(request) => {
                        self.maybe_heartbeat()?;
                        return Ok(Some(request));
                    }
                    BrokerEvent::Heartbeat | BrokerEvent::Ignored => {}
                    BrokerEvent::Disconnect => {
                        self.reconnect()?;
                        return Ok(None);
                    }
                }
            }
            Err(CodecError::Io(source)) if is_timeout(&source) => {
                self.liveness_remaining = self.liveness_remaining.saturating_sub(1);
                if self.liveness_remaining == 0 {
                    thread::sleep(self.options.reconnect_delay);
                    self.reconnect()?;
                    return Ok(None);
                }
            }
            Err(CodecError::Io(source)) if is_disconnection(&source) => {
                thread::sleep(self.options.reconnect_delay);
                self.reconnect()?;
                return Ok(None);
            }
            Err(source) => return Err(WorkerError::Codec(source)),
        }

        self.maybe_heartbeat()?;
        Ok(None)
    }

    pub fn reply(&mut self, request: &WorkRequest, body: Vec<Frame>) -> Result<(), WorkerError> {
        let mut frames = vec![
            Vec::new(),
            WORKER_HEADER.to_vec(),
            WorkerCommand::Reply.as_frame(),
            request.client.clone(),
            Vec::new(),
        ];
        frames.extend(body);
        codec::write_message(&mut self.stream, &frames).map_err(WorkerError::Codec)
    }

    pub fn serve<F>(&mut self, mut handler: F, stop: &AtomicBool) -> Result<(), WorkerError>
    where
        F: FnMut(&WorkRequest) -> Vec<Frame>,
    {
        while !stop.load(Ordering::SeqCst) {
            if let Some(request) = self.poll()? {
                let body = handler(&request);
                self.reply(&request, body)?;
            }
        }
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), WorkerError> {
        let mut stream = open_stream(&self.address, self.options.heartbeat_interval)?;
        send_ready(&mut stream, &self.service)?;

        self.stream = stream;
        self.liveness_remaining = self.options.liveness;
        self.heartbeat_at = Instant::now() + self.options.heartbeat_interval;
        Ok(())
    }

    fn maybe_heartbeat(&mut self) -> Result<(), WorkerError> {
        if Instant::now() < self.heartbeat_at {
            return Ok(());
        }

        let frames = vec![
            Vec::new(),
            WORKER_HEADER.to_vec(),
            WorkerCommand::Heartbeat.as_frame(),
        ];
        codec::write_message(&mut self.stream, &frames).map_err(WorkerError::Codec)?;
        self.heartbeat_at = Instant::now() + self.options.heartbeat_interval;
        Ok(())
    }
}

fn open_stream(address: &str, read_timeout: Duration) -> Result<TcpStream, WorkerError> {
    let stream = TcpStream::connect(address).map_err(|source| WorkerError::Connect {
        address: address.to_owned(),
        source,
    })?;
    stream
        .set_nodelay(true)
        .map_err(|source| WorkerError::ConfigureStream { source })?;
    stream
        .set_read_timeout(Some(read_timeout))
        .map_err(|source| WorkerError::ConfigureStream { source })?;
    Ok(stream)
}

fn send_ready(stream: &mut TcpStream, service: &str) -> Result<(), WorkerError> {
    let frames = vec![
        Vec::new(),
        WORKER_HEADER.to_vec(),
        WorkerCommand::Ready.as_frame(),
        service.as_bytes().to_vec(),
    ];
    codec::write_message(stream, &frames).map_err(WorkerError::Codec)
}

fn parse_broker_event(mut frames: Message) -> Result<BrokerEvent, WorkerError> {
    if frames.len() < 3 || !frames[0].is_empty() || frames[1] != WORKER_HEADER {
        return Ok(BrokerEvent::Ignored);
    }
    frames.drain(..2);

    let command_frame = frames.remove(0);
    match WorkerCommand::from_frame(&command_frame) {
        Some(WorkerCommand::Request) => {
            let Some((client, body)) = unwrap_envelope(frames) else {
                return Err(WorkerError::MalformedRequest);
            };
            Ok(BrokerEvent::Request(WorkRequest { client, body }))
        }
        Some(WorkerCommand::Heartbeat) => Ok(BrokerEvent::Heartbeat),
        Some(WorkerCommand::Disconnect) => Ok(BrokerEvent::Disconnect),
        _ => Ok(BrokerEvent::Ignored),
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn is_disconnection(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use crate::protocol::{WorkerCommand, WORKER_HEADER};
    use crate::wire::codec;

    use super::{ServiceWorker, WorkerError, WorkerOptions};

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            heartbeat_interval: Duration::from_millis(50),
            liveness: 3,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    fn assert_ready(stream: &mut TcpStream, service: &str) {
        let message = codec::read_message(stream).expect("READY should decode");
        assert_eq!(message[0], Vec::<u8>::new());
        assert_eq!(message[1], WORKER_HEADER.to_vec());
        assert_eq!(message[2], WorkerCommand::Ready.as_frame());
        assert_eq!(message[3], service.as_bytes().to_vec());
    }

    fn request_frames(client: &[u8], body: &[&str]) -> Vec<Vec<u8>> {
        let mut frames = vec![
            Vec::new(),
            WORKER_HEADER.to_vec(),
            WorkerCommand::Request.as_frame(),
            client.to_vec(),
            Vec::new(),
        ];
        frames.extend(body.iter().map(|part| part.as_bytes().to_vec()));
        frames
    }

    #[test]
    fn connect_sends_ready_for_the_service() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("listener addr should exist");

        let broker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("broker should accept");
            assert_ready(&mut stream, "echo");
        });

        let _worker =
            ServiceWorker::connect_with_options(&address.to_string(), "echo", fast_options())
                .expect("worker should connect");
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn zero_liveness_is_rejected() {
        let options = WorkerOptions {
            liveness: 0,
            ..fast_options()
        };
        let error = ServiceWorker::connect_with_options("127.0.0.1:1", "echo", options)
            .expect_err("zero liveness should fail before connecting");
        assert!(matches!(error, WorkerError::InvalidLiveness));
    }

    #[test]
    fn poll_returns_request_and_reply_reaches_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("listener addr should exist");

        let broker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("broker should accept");
            assert_ready(&mut stream, "echo");

            codec::write_message(&mut stream, &request_frames(b"client-1", &["hello"]))
                .expect("REQUEST should write");

            // Skip over interleaved heartbeats until the REPLY arrives.
            let reply = loop {
                let message = codec::read_message(&mut stream).expect("message should decode");
                if message[2] == WorkerCommand::Reply.as_frame() {
                    break message;
                }
            };
            assert_eq!(reply[1], WORKER_HEADER.to_vec());
            assert_eq!(reply[3], b"client-1".to_vec());
            assert_eq!(reply[4], Vec::<u8>::new());
            assert_eq!(reply[5], b"hello".to_vec());
        });

        let mut worker =
            ServiceWorker::connect_with_options(&address.to_string(), "echo", fast_options())
                .expect("worker should connect");

        let mut request = None;
        for _ in 0..20 {
            if let Some(received) = worker.poll().expect("poll should not fail") {
                request = Some(received);
                break;
            }
        }
        let request = request.expect("worker should receive the request");
        assert_eq!(request.client, b"client-1".to_vec());
        assert_eq!(request.body, vec![b"hello".to_vec()]);

        let body = request.body.clone();
        worker.reply(&request, body).expect("reply should send");
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn idle_worker_emits_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("listener addr should exist");
        let (observed_tx, observed_rx) = mpsc::channel::<()>();

        let broker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("broker should accept");
            assert_ready(&mut stream, "echo");

            let message = codec::read_message(&mut stream).expect("heartbeat should decode");
            assert_eq!(message[1], WORKER_HEADER.to_vec());
            assert_eq!(message[2], WorkerCommand::Heartbeat.as_frame());
            observed_tx
                .send(())
                .expect("heartbeat observation should send");

            // Keep the connection open until the worker side is done.
            let _ = codec::read_message(&mut stream);
        });

        let mut worker =
            ServiceWorker::connect_with_options(&address.to_string(), "echo", fast_options())
                .expect("worker should connect");
        let mut observed = false;
        for _ in 0..50 {
            worker.poll().expect("poll should not fail");
            if observed_rx.try_recv().is_ok() {
                observed = true;
                break;
            }
        }

        assert!(observed, "broker should observe a heartbeat");
        drop(worker);
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn disconnect_triggers_fresh_ready_on_a_new_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("listener addr should exist");
        let (reconnected_tx, reconnected_rx) = mpsc::channel::<()>();

        let broker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("broker should accept");
            assert_ready(&mut stream, "echo");

            let disconnect = vec![
                Vec::new(),
                WORKER_HEADER.to_vec(),
                WorkerCommand::Disconnect.as_frame(),
            ];
            codec::write_message(&mut stream, &disconnect).expect("DISCONNECT should write");

            // Eviction is followed by re-registration over a new connection.
            let (mut second, _) = listener.accept().expect("broker should accept again");
            assert_ready(&mut second, "echo");
            reconnected_tx
                .send(())
                .expect("reconnect observation should send");
            let _ = codec::read_message(&mut second);
        });

        let mut worker =
            ServiceWorker::connect_with_options(&address.to_string(), "echo", fast_options())
                .expect("worker should connect");
        let mut reconnected = false;
        for _ in 0..50 {
            worker.poll().expect("poll should not fail");
            if reconnected_rx.try_recv().is_ok() {
                reconnected = true;
                break;
            }
        }

        assert!(reconnected, "broker should see a fresh READY");
        drop(worker);
        broker.join().expect("broker thread should finish");
    }

    #[test]
    fn silent_broker_exhausts_liveness_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().expect("listener addr should exist");
        let (reconnected_tx, reconnected_rx) = mpsc::channel::<()>();

        let broker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("broker should accept");
            assert_ready(&mut stream, "echo");

            // Say nothing: the worker should give up after its liveness
            // window and come back with a fresh READY.
            let (mut second, _) = listener.accept().expect("broker should accept again");
            assert_ready(&mut second, "echo");
            reconnected_tx
                .send(())
                .expect("reconnect observation should send");
            let _ = codec::read_message(&mut second);
            drop(stream);
        });

        let options = WorkerOptions {
            heartbeat_interval: Duration::from_millis(30),
            liveness: 2,
            reconnect_delay: Duration::from_millis(10),
        };
        let mut worker =
            ServiceWorker::connect_with_options(&address.to_string(), "echo", options)
                .expect("worker should connect");
        let mut reconnected = false;
        for _ in 0..50 {
            worker.poll().expect("poll should not fail");
            if reconnected_rx.try_recv().is_ok() {
                reconnected = true;
                break;
            }
        }

        assert!(reconnected, "broker should see a fresh READY");
        drop(worker);
        broker.join().expect("broker thread should finish");
    }
}
