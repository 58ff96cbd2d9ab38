//! Peer identity: numeric peer code, nick validation, and the per-peer record kept in presence.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use rand::Rng;
use serde::Deserialize;

/// Longest allowed nick, in characters.
pub const MAX_NICK_LEN: usize = 10;

/// Smallest generated peer code. Codes are drawn from `[CODE_BASE, CODE_BASE + CODE_SPAN]`.
const CODE_BASE: u32 = 10_000_000;
const CODE_SPAN: u32 = 9_999_999;

/// Default chat color, packed ARGB as a signed integer (what goes on the wire).
pub const DEFAULT_COLOR: i32 = -15_987_646;

/// Numeric peer code. Random at startup, expected to be unique on the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerCode(pub u32);

impl PeerCode {
    /// Generate a random code in the 8-digit range.
    pub fn generate() -> Self {
        PeerCode(CODE_BASE + rand::thread_rng().gen_range(0..=CODE_SPAN))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerCode {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(PeerCode)
    }
}

/// True if `nick` is 1-10 characters of letters, digits, `-`, `_` or `.`.
pub fn is_valid_nick(nick: &str) -> bool {
    let len = nick.chars().count();
    (1..=MAX_NICK_LEN).contains(&len)
        && nick
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Build a default nick from an OS user name: first word, shortened, first letter capitalised.
/// Falls back to the peer code when the result is not a valid nick.
pub fn default_nick(user_name: Option<&str>, code: PeerCode) -> String {
    let candidate = user_name
        .and_then(|n| n.split(' ').next())
        .map(|n| {
            let short: String = n.trim().chars().take(MAX_NICK_LEN).collect();
            let mut chars = short.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .unwrap_or_default();
    if is_valid_nick(&candidate) {
        candidate
    } else {
        code.to_string()
    }
}

/// User-chosen profile values. Loaded from the `[profile]` table of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Preferred nick. Defaults to one derived from the OS user name.
    #[serde(default)]
    pub nick: Option<String>,
    /// Chat color sent with chat and private messages.
    #[serde(default = "default_color")]
    pub own_color: i32,
}

fn default_color() -> i32 {
    DEFAULT_COLOR
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            nick: None,
            own_color: DEFAULT_COLOR,
        }
    }
}

/// Everything known about one peer, including this client ("me").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub code: PeerCode,
    pub nick: String,
    pub ip: Option<IpAddr>,
    pub host_name: Option<String>,
    pub client: String,
    pub operating_system: String,
    /// Milliseconds since the Unix epoch.
    pub logon_time: u64,
    /// Milliseconds since the Unix epoch of the last message seen from this peer.
    pub last_activity: u64,
    pub away: bool,
    pub away_message: String,
    /// 0 when the peer cannot receive private chat.
    pub private_chat_port: u16,
    pub writing: bool,
    pub is_me: bool,
}

impl PeerIdentity {
    /// A freshly sighted remote peer with only code, nick and address known.
    pub fn new(code: PeerCode, nick: impl Into<String>, ip: Option<IpAddr>, now_ms: u64) -> Self {
        Self {
            code,
            nick: nick.into(),
            ip,
            host_name: None,
            client: String::new(),
            operating_system: String::new(),
            logon_time: now_ms,
            last_activity: now_ms,
            away: false,
            away_message: String::new(),
            private_chat_port: 0,
            writing: false,
            is_me: false,
        }
    }

    /// The local identity.
    pub fn me(code: PeerCode, nick: impl Into<String>, client: impl Into<String>, now_ms: u64) -> Self {
        let mut me = Self::new(code, nick, None, now_ms);
        me.client = client.into();
        me.operating_system = std::env::consts::OS.to_string();
        me.is_me = true;
        me
    }

    pub fn can_receive_private_chat(&self) -> bool {
        self.private_chat_port != 0 && self.ip.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_in_range() {
        for _ in 0..100 {
            let c = PeerCode::generate().as_u32();
            assert!((10_000_000..=19_999_999).contains(&c));
        }
    }

    #[test]
    fn nick_validation() {
        assert!(is_valid_nick("Christian"));
        assert!(is_valid_nick("a"));
        assert!(is_valid_nick("ab-c_d.e9"));
        assert!(is_valid_nick("Ærlig"));
        assert!(is_valid_nick("0123456789"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("01234567890"));
        assert!(!is_valid_nick("has space"));
        assert!(!is_valid_nick("colon:"));
        assert!(!is_valid_nick("bang!"));
    }

    #[test]
    fn default_nick_from_user_name() {
        let code = PeerCode(12345678);
        assert_eq!(default_nick(Some("christian"), code), "Christian");
        assert_eq!(default_nick(Some("john smith"), code), "John");
        assert_eq!(default_nick(Some("averyveryverylongname"), code), "Averyveryv");
        assert_eq!(default_nick(Some("we!rd"), code), "12345678");
        assert_eq!(default_nick(None, code), "12345678");
    }

    #[test]
    fn code_parse_display() {
        let c: PeerCode = " 11111111".parse().unwrap();
        assert_eq!(c.to_string(), "11111111");
        assert!("abc".parse::<PeerCode>().is_err());
    }

    #[test]
    fn private_chat_requires_port_and_ip() {
        let mut p = PeerIdentity::new(PeerCode(1), "a", None, 0);
        p.private_chat_port = 50150;
        assert!(!p.can_receive_private_chat());
        p.ip = Some("10.0.0.2".parse().unwrap());
        assert!(p.can_receive_private_chat());
    }
}
