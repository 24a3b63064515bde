use std::fmt;

pub const CLIENT_HEADER: &[u8] = b"MDPC01";
pub const WORKER_HEADER: &[u8] = b"MDPW01";

// Reserved management prefix; service names starting with it are answered by
// the broker itself and are never valid READY targets. Case-sensitive.
pub const MMI_PREFIX: &str = "mmi.";
pub const MMI_SERVICE_QUERY: &str = "mmi.service";

pub const MMI_STATUS_FOUND: &[u8] = b"200";
pub const MMI_STATUS_NOT_FOUND: &[u8] = b"404";
pub const MMI_STATUS_NOT_IMPLEMENTED: &[u8] = b"501";

pub type Frame = Vec<u8>;
pub type Message = Vec<Frame>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    Ready,
    Request,
    Reply,
    Heartbeat,
    Disconnect,
}

impl WorkerCommand {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ready => 0x01,
            Self::Request => 0x02,
            Self::Reply => 0x03,
            Self::Heartbeat => 0x04,
            Self::Disconnect => 0x05,
        }
    }

    pub fn as_frame(self) -> Frame {
        vec![self.as_byte()]
    }

    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [0x01] => Some(Self::Ready),
            [0x02] => Some(Self::Request),
            [0x03] => Some(Self::Reply),
            [0x04] => Some(Self::Heartbeat),
            [0x05] => Some(Self::Disconnect),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Request => "REQUEST",
            Self::Reply => "REPLY",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
        };
        write!(f, "{name}")
    }
}

pub fn is_reserved_service(name: &str) -> bool {
    name.starts_with(MMI_PREFIX)
}

// Peels `[sender, "", rest...]` off the front of a message. Returns None when
// the delimiter frame is absent or non-empty.
pub fn unwrap_envelope(mut frames: Message) -> Option<(Frame, Message)> {
    if frames.len() < 2 || !frames[1].is_empty() {
        return None;
    }

    let sender = frames.remove(0);
    frames.remove(0);
    Some((sender, frames))
}

pub fn display_identity(identity: &[u8]) -> String {
    String::from_utf8_lossy(identity).into_owned()
}
