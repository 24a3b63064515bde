use std::fmt;

use crate::protocol::{
    unwrap_envelope, Frame, Message, WorkerCommand, CLIENT_HEADER, WORKER_HEADER,
};

// Typed view of one inbound message, before any broker state is touched.
// Classification failures are per-message errors; the connection and the
// broker both survive them.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundAction {
    ClientRequest { service: String, body: Vec<Frame> },
    WorkerReady { service: String },
    WorkerReply { client: Frame, body: Vec<Frame> },
    WorkerHeartbeat,
    WorkerDisconnect,
}

#[derive(Debug)]
pub enum SessionError {
    MissingDelimiter,
    MissingProtocolHeader,
    UnknownProtocolHeader { header: Frame },
    MissingServiceFrame,
    ServiceNameNotUtf8,
    MissingRequestBody { service: String },
    MissingCommandFrame,
    UnknownWorkerCommand { command: Frame },
    CommandNotAllowed { command: WorkerCommand },
    MalformedReplyEnvelope,
    UnexpectedFrames { command: WorkerCommand, count: usize },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDelimiter => {
                write!(f, "message must start with an empty delimiter frame")
            }
            Self::MissingProtocolHeader => write!(f, "message is missing the protocol header"),
            Self::UnknownProtocolHeader { header } => write!(
                f,
                "unknown protocol header '{}'",
                String::from_utf8_lossy(header)
            ),
            Self::MissingServiceFrame => write!(f, "message is missing the service name frame"),
            Self::ServiceNameNotUtf8 => write!(f, "service name must be valid UTF-8"),
            Self::MissingRequestBody { service } => {
                write!(f, "client request for '{service}' has no body frames")
            }
            Self::MissingCommandFrame => write!(f, "worker message is missing the command frame"),
            Self::UnknownWorkerCommand { command } => {
                write!(f, "unknown worker command frame {command:02x?}")
            }
            Self::CommandNotAllowed { command } => {
                write!(f, "{command} is not a valid worker-to-broker command")
            }
            Self::MalformedReplyEnvelope => {
                write!(f, "REPLY payload must carry a client envelope and delimiter")
            }
            Self::UnexpectedFrames { command, count } => {
                write!(f, "{command} carries {count} unexpected extra frames")
            }
        }
    }
}

impl std::error::Error for SessionError {}

pub fn classify_message(mut frames: Message) -> Result<InboundAction, SessionError> {
    if frames.is_empty() || !frames[0].is_empty() {
        return Err(SessionError::MissingDelimiter);
    }
    frames.remove(0);

    if frames.is_empty() {
        return Err(SessionError::MissingProtocolHeader);
    }
    let header = frames.remove(0);

    if header == CLIENT_HEADER {
        return classify_client_request(frames);
    }
    if header == WORKER_HEADER {
        return classify_worker_command(frames);
    }

    Err(SessionError::UnknownProtocolHeader { header })
}

fn classify_client_request(mut frames: Message) -> Result<InboundAction, SessionError> {
    if frames.is_empty() {
        return Err(SessionError::MissingServiceFrame);
    }

    let service = parse_service_name(frames.remove(0))?;
    if frames.is_empty() {
        return Err(SessionError::MissingRequestBody { service });
    }

    Ok(InboundAction::ClientRequest {
        service,
        body: frames,
    })
}

fn classify_worker_command(mut frames: Message) -> Result<InboundAction, SessionError> {
    if frames.is_empty() {
        return Err(SessionError::MissingCommandFrame);
    }

    let command_frame = frames.remove(0);
    let Some(command) = WorkerCommand::from_frame(&command_frame) else {
        return Err(SessionError::UnknownWorkerCommand {
            command: command_frame,
        });
    };

    match command {
        WorkerCommand::Ready => {
            if frames.is_empty() {
                return Err(SessionError::MissingServiceFrame);
            }
            if frames.len() > 1 {
                return Err(SessionError::UnexpectedFrames {
                    command,
                    count: frames.len() - 1,
                });
            }
            let service = parse_service_name(frames.remove(0))?;
            Ok(InboundAction::WorkerReady { service })
        }
        WorkerCommand::Reply => {
            let Some((client, body)) = unwrap_envelope(frames) else {
                return Err(SessionError::MalformedReplyEnvelope);
            };
            Ok(InboundAction::WorkerReply { client, body })
        }
        WorkerCommand::Heartbeat => {
            if !frames.is_empty() {
                return Err(SessionError::UnexpectedFrames {
                    command,
                    count: frames.len(),
                });
            }
            Ok(InboundAction::WorkerHeartbeat)
        }
        WorkerCommand::Disconnect => {
            if !frames.is_empty() {
                return Err(SessionError::UnexpectedFrames {
                    command,
                    count: frames.len(),
                });
            }
            Ok(InboundAction::WorkerDisconnect)
        }
        // REQUEST only travels broker-to-worker.
        WorkerCommand::Request => Err(SessionError::CommandNotAllowed { command }),
    }
}

fn parse_service_name(frame: Frame) -> Result<String, SessionError> {
    String::from_utf8(frame).map_err(|_| SessionError::ServiceNameNotUtf8)
}
