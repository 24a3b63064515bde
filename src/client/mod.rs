use std::fmt;
use std::io;
use std::net::TcpStream;
use std::time::Duration;

use crate::protocol::{Frame, CLIENT_HEADER};
use crate::wire::codec::{self, CodecError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug)]
pub enum ClientError {
    Connect { address: String, source: io::Error },
    ConfigureStream { source: io::Error },
    Codec(CodecError),
    Timeout { service: String },
    MalformedReply,
    ServiceMismatch { expected: String, actual: String },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { address, source } => {
                write!(f, "failed to connect to broker at {address}: {source}")
            }
            Self::ConfigureStream { source } => {
                write!(f, "failed to configure client stream: {source}")
            }
            Self::Codec(source) => write!(f, "client wire error: {source}"),
            Self::Timeout { service } => {
                write!(f, "timed out waiting for reply from service '{service}'")
            }
            Self::MalformedReply => write!(f, "broker reply is missing envelope frames"),
            Self::ServiceMismatch { expected, actual } => write!(
                f,
                "reply names service '{actual}', expected '{expected}'"
            ),
        }
    }
}

impl std::error::Error for ClientError {}

// Blocking convenience wrapper: frames a (service, body) request and waits
// for the matching reply. One request in flight at a time.
pub struct ServiceClient {
    stream: TcpStream,
    timeout: Duration,
}

impl ServiceClient {
    pub fn connect(address: &str) -> Result<Self, ClientError> {
        Self::connect_with_timeout(address, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn connect_with_timeout(address: &str, timeout: Duration) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).map_err(|source| ClientError::Connect {
            address: address.to_owned(),
            source,
        })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ClientError::ConfigureStream { source })?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|source| ClientError::ConfigureStream { source })?;

        Ok(Self { stream, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn request(
        &mut self,
        service: &str,
        body: Vec<Frame>,
    ) -> Result<Vec<Frame>, ClientError> {
        let mut frames = vec![
            Vec::new(),
            CLIENT_HEADER.to_vec(),
            service.as_bytes().to_vec(),
        ];
        frames.extend(body);
        codec::write_message(&mut self.stream, &frames).map_err(ClientError::Codec)?;

        let reply = match codec::read_message(&mut self.stream) {
            Ok(reply) => reply,
            Err(CodecError::Io(source))
                if source.kind() == io::ErrorKind::WouldBlock
                    || source.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(ClientError::Timeout {
                    service: service.to_owned(),
                });
            }
            Err(source) => return Err(ClientError::Codec(source)),
        };

        parse_reply(service, reply)
    }
}

fn parse_reply(service: &str, mut frames: Vec<Frame>) -> Result<Vec<Frame>, ClientError> {
    if frames.len() < 3 || !frames[0].is_empty() || frames[1] != CLIENT_HEADER {
        return Err(ClientError::MalformedReply);
    }
    frames.drain(..2);

    let reply_service = frames.remove(0);
    if reply_service != service.as_bytes() {
        return Err(ClientError::ServiceMismatch {
            expected: service.to_owned(),
            actual: String::from_utf8_lossy(&reply_service).into_owned(),
        });
    }

    Ok(frames)
}
