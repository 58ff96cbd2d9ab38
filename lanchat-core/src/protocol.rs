//! LAN chat wire protocol: message types and their payloads.

use crate::identity::PeerCode;

/// Maximum datagram size, in bytes. Longer messages are truncated by the sender's socket.
pub const PACKET_SIZE: usize = 1024;

/// One protocol message: who sent it, under which nick, and the type-specific body.
/// Encoding is `<code>!<TYPE>#<nick>:<payload>` (see the wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: PeerCode,
    pub nick: String,
    pub body: Body,
}

impl Message {
    pub fn new(code: PeerCode, nick: impl Into<String>, body: Body) -> Self {
        Self {
            code,
            nick: nick.into(),
            body,
        }
    }

    /// The wire name of this message's type.
    pub fn kind(&self) -> &str {
        self.body.kind()
    }
}

/// All message bodies. Unknown types decode to `Unrecognized` so newer clients do not break older ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Periodic keepalive.
    Idle,
    Logon,
    Logoff,
    /// Ask every peer to identify itself.
    Expose,
    /// Reply to `Expose`. Carries the away message (empty when not away).
    Exposing { away_message: String },
    GetTopic,
    /// Current topic. Sent on change and in reply to `GetTopic`.
    Topic {
        set_by: String,
        time: u64,
        text: String,
    },
    Away { message: String },
    Back,
    /// Nick change: the header nick is the new nick.
    NickChange,
    /// Someone else already uses `nick`.
    NickConflict { nick: String },
    WritingStarted,
    WritingStopped,
    ClientInfo {
        client: String,
        uptime: u64,
        operating_system: String,
        private_chat_port: u16,
    },
    Chat { color: i32, text: String },
    PrivateChat {
        to: PeerCode,
        color: i32,
        text: String,
    },
    FileOffer {
        to: PeerCode,
        size: u64,
        hash: i32,
        file_name: String,
    },
    FileAccept {
        to: PeerCode,
        port: u16,
        hash: i32,
        file_name: String,
    },
    FileAbort {
        to: PeerCode,
        hash: i32,
        file_name: String,
    },
    /// A type this client does not know. Kept verbatim.
    Unrecognized { kind: String, payload: String },
}

impl Body {
    pub fn kind(&self) -> &str {
        match self {
            Body::Idle => "IDLE",
            Body::Logon => "LOGON",
            Body::Logoff => "LOGOFF",
            Body::Expose => "EXPOSE",
            Body::Exposing { .. } => "EXPOSING",
            Body::GetTopic => "GETTOPIC",
            Body::Topic { .. } => "TOPIC",
            Body::Away { .. } => "AWAY",
            Body::Back => "BACK",
            Body::NickChange => "NICK",
            Body::NickConflict { .. } => "NICKCRASH",
            Body::WritingStarted => "WRITING",
            Body::WritingStopped => "STOPPEDWRITING",
            Body::ClientInfo { .. } => "CLIENT",
            Body::Chat { .. } => "MSG",
            Body::PrivateChat { .. } => "PRIVMSG",
            Body::FileOffer { .. } => "SENDFILE",
            Body::FileAccept { .. } => "SENDFILEACCEPT",
            Body::FileAbort { .. } => "SENDFILEABORT",
            Body::Unrecognized { kind, .. } => kind,
        }
    }

    /// The peer a targeted message is meant for, if any.
    pub fn target(&self) -> Option<PeerCode> {
        match self {
            Body::PrivateChat { to, .. }
            | Body::FileOffer { to, .. }
            | Body::FileAccept { to, .. }
            | Body::FileAbort { to, .. } => Some(*to),
            _ => None,
        }
    }

    /// Offer/accept/abort: messages that negotiate a file transfer.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Body::FileOffer { .. } | Body::FileAccept { .. } | Body::FileAbort { .. }
        )
    }
}

/// Stable 32-bit hash of a file name, sent with offers so both sides can tell same-named files apart.
pub fn file_hash(file_name: &str) -> i32 {
    file_name
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}
