use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use crate::config;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5555;

const MAX_WRITE_STALLS: u32 = 200;
const WRITE_STALL_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(
                    f,
                    "failed to clone accepted TCP stream for full duplex IO: {source}"
                )
            }
        }
    }
}

impl std::error::Error for ServerError {}

// One accepted client or worker connection. The identity doubles as the
// routing envelope frame the broker stamps on every message.
pub struct PersistentConnection {
    identity: Uuid,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl PersistentConnection {
    fn new(identity: Uuid, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            identity,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn identity_frame(&self) -> Vec<u8> {
        self.identity.to_string().into_bytes()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    // Writes a whole wire frame; a partial write would corrupt the framing
    // for everything behind it. Bounded retries on a stalled peer, then the
    // connection is reported broken.
    pub fn write_frame(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");

        let mut written = 0;
        let mut stalls = 0;
        while written < payload.len() {
            match writer.write(&payload[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed mid-frame",
                    ));
                }
                Ok(count) => {
                    written += count;
                    stalls = 0;
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls > MAX_WRITE_STALLS {
                        return Err(error);
                    }
                    thread::sleep(WRITE_STALL_BACKOFF);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

pub struct TcpServer {
    listener: TcpListener,
    active_connections: Mutex<HashMap<Uuid, Arc<PersistentConnection>>>,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let identity = Uuid::new_v4();
                let connection =
                    Arc::new(PersistentConnection::new(identity, stream, peer_addr)?);
                self.active_connections
                    .lock()
                    .expect("active connections lock poisoned")
                    .insert(identity, Arc::clone(&connection));
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::ConfigureAcceptedStream { source }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
            .len()
    }

    pub fn drop_connection(&self, identity: Uuid) {
        self.active_connections
            .lock()
            .expect("active connections lock poisoned")
            .remove(&identity);
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = self
            .active_connections
            .lock()
            .expect("active connections lock poisoned");

        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }
}
