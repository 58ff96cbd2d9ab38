//! Text framing: `<code>!<TYPE>#<nick>:<payload>`, one message per datagram.
//!
//! Payload sub-fields appear in a fixed order, each wrapped in its own delimiters:
//! `(target or name)`, `[number]`, `{number}`, `<port>`, then trailing free text.

use std::str::FromStr;

use crate::identity::PeerCode;
use crate::protocol::{Body, Message};

/// Encode a message into its datagram text.
pub fn encode(msg: &Message) -> String {
    let mut out = format!("{}!{}#{}:", msg.code, msg.body.kind(), msg.nick);
    match &msg.body {
        Body::Idle
        | Body::Logon
        | Body::Logoff
        | Body::Expose
        | Body::GetTopic
        | Body::Back
        | Body::NickChange
        | Body::WritingStarted
        | Body::WritingStopped => {}
        Body::Exposing { away_message } => out.push_str(away_message),
        Body::Away { message } => out.push_str(message),
        Body::NickConflict { nick } => out.push_str(nick),
        Body::Topic { set_by, time, text } => {
            out.push_str(&format!("({set_by})[{time}]{text}"));
        }
        Body::ClientInfo {
            client,
            uptime,
            operating_system,
            private_chat_port,
        } => {
            out.push_str(&format!(
                "({client})[{uptime}]{{{operating_system}}}<{private_chat_port}>"
            ));
        }
        Body::Chat { color, text } => out.push_str(&format!("[{color}]{text}")),
        Body::PrivateChat { to, color, text } => {
            out.push_str(&format!("({to})[{color}]{text}"));
        }
        Body::FileOffer {
            to,
            size,
            hash,
            file_name,
        } => out.push_str(&format!("({to})[{size}]{{{hash}}}{file_name}")),
        Body::FileAccept {
            to,
            port,
            hash,
            file_name,
        } => out.push_str(&format!("({to})[{port}]{{{hash}}}{file_name}")),
        Body::FileAbort {
            to,
            hash,
            file_name,
        } => out.push_str(&format!("({to}){{{hash}}}{file_name}")),
        Body::Unrecognized { payload, .. } => out.push_str(payload),
    }
    out
}

/// Decode one datagram's text. Only a broken envelope is an error; odd payloads decode to partial fields.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let (code, rest) = text
        .split_once('!')
        .ok_or(DecodeError::MissingSeparator('!'))?;
    let code = PeerCode::from_str(code).map_err(|_| DecodeError::InvalidCode(code.to_string()))?;
    let (kind, rest) = rest
        .split_once('#')
        .ok_or(DecodeError::MissingSeparator('#'))?;
    let (nick, payload) = rest
        .split_once(':')
        .ok_or(DecodeError::MissingSeparator(':'))?;
    let body = decode_body(kind, payload);
    Ok(Message::new(code, nick, body))
}

fn decode_body(kind: &str, payload: &str) -> Body {
    let mut f = Fields::new(payload);
    match kind {
        "IDLE" => Body::Idle,
        "LOGON" => Body::Logon,
        "LOGOFF" => Body::Logoff,
        "EXPOSE" => Body::Expose,
        "EXPOSING" => Body::Exposing {
            away_message: payload.to_string(),
        },
        "GETTOPIC" => Body::GetTopic,
        "TOPIC" => Body::Topic {
            set_by: f.take('(', ')').unwrap_or_default().to_string(),
            time: f.number('[', ']'),
            text: f.rest().to_string(),
        },
        "AWAY" => Body::Away {
            message: payload.to_string(),
        },
        "BACK" => Body::Back,
        "NICK" => Body::NickChange,
        "NICKCRASH" => Body::NickConflict {
            nick: payload.to_string(),
        },
        "WRITING" => Body::WritingStarted,
        "STOPPEDWRITING" => Body::WritingStopped,
        "CLIENT" => Body::ClientInfo {
            client: f.take('(', ')').unwrap_or_default().to_string(),
            uptime: f.number('[', ']'),
            operating_system: f.take('{', '}').unwrap_or_default().to_string(),
            private_chat_port: f.number('<', '>'),
        },
        "MSG" => Body::Chat {
            color: f.number('[', ']'),
            text: f.rest().to_string(),
        },
        "PRIVMSG" => Body::PrivateChat {
            to: PeerCode(f.number('(', ')')),
            color: f.number('[', ']'),
            text: f.rest().to_string(),
        },
        "SENDFILE" => Body::FileOffer {
            to: PeerCode(f.number('(', ')')),
            size: f.number('[', ']'),
            hash: f.number('{', '}'),
            file_name: f.rest().to_string(),
        },
        "SENDFILEACCEPT" => Body::FileAccept {
            to: PeerCode(f.number('(', ')')),
            port: f.number('[', ']'),
            hash: f.number('{', '}'),
            file_name: f.rest().to_string(),
        },
        "SENDFILEABORT" => Body::FileAbort {
            to: PeerCode(f.number('(', ')')),
            hash: f.number('{', '}'),
            file_name: f.rest().to_string(),
        },
        other => Body::Unrecognized {
            kind: other.to_string(),
            payload: payload.to_string(),
        },
    }
}

/// Cursor over a payload's delimited sub-fields.
struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn new(payload: &'a str) -> Self {
        Self { rest: payload }
    }

    /// Take `open ... close` from the front. Leaves the cursor untouched when the field is absent.
    fn take(&mut self, open: char, close: char) -> Option<&'a str> {
        let inner = self.rest.strip_prefix(open)?;
        let end = inner.find(close)?;
        self.rest = &inner[end + close.len_utf8()..];
        Some(&inner[..end])
    }

    /// Numeric field; absent or unparsable values read as zero.
    fn number<T: FromStr + Default>(&mut self, open: char, close: char) -> T {
        self.take(open, close)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default()
    }

    fn rest(&self) -> &'a str {
        self.rest
    }
}

/// The datagram is not a protocol message at all.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing '{0}' separator")]
    MissingSeparator(char),
    #[error("invalid peer code '{0}'")]
    InvalidCode(String),
}
