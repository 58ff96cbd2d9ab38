//! Load config from file and environment.

use lanchat_core::Profile;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_NICK, LANCHAT_CHAT_PORT, LANCHAT_PRIVATE_PORT, LANCHAT_TRANSFER_PORT,
/// LANCHAT_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Nick and chat color.
    #[serde(default)]
    pub profile: Profile,
    /// Group all chat traffic goes to (default 229.5.38.17).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Multicast UDP port (default 50050).
    #[serde(default = "default_chat_port")]
    pub chat_port: u16,
    /// First port tried for private chat (default 50150).
    #[serde(default = "default_private_chat_port")]
    pub private_chat_port: u16,
    /// First port tried for incoming file streams (default 50250).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    /// Consecutive ports tried from each base (default 10).
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
    /// Where received files go (default: current directory).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// How long an accepted transfer waits for the sender to connect.
    #[serde(default = "default_interval_secs")]
    pub accept_timeout_secs: u64,
    /// env_logger filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(229, 5, 38, 17)
}
fn default_chat_port() -> u16 {
    50050
}
fn default_private_chat_port() -> u16 {
    50150
}
fn default_transfer_port() -> u16 {
    50250
}
fn default_port_attempts() -> u16 {
    10
}
fn default_interval_secs() -> u64 {
    15
}
fn default_peer_timeout_secs() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            multicast_group: default_multicast_group(),
            chat_port: default_chat_port(),
            private_chat_port: default_private_chat_port(),
            transfer_port: default_transfer_port(),
            port_attempts: default_port_attempts(),
            download_dir: None,
            check_interval_secs: default_interval_secs(),
            idle_interval_secs: default_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            accept_timeout_secs: default_interval_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs.max(1))
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Apply LANCHAT_* overrides from `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(nick) = var("LANCHAT_NICK") {
            self.profile.nick = Some(nick);
        }
        let port = |name: &str| var(name).and_then(|s| s.parse::<u16>().ok());
        if let Some(p) = port("LANCHAT_CHAT_PORT") {
            self.chat_port = p;
        }
        if let Some(p) = port("LANCHAT_PRIVATE_PORT") {
            self.private_chat_port = p;
        }
        if let Some(p) = port("LANCHAT_TRANSFER_PORT") {
            self.transfer_port = p;
        }
        if let Some(dir) = var("LANCHAT_DOWNLOAD_DIR") {
            self.download_dir = Some(PathBuf::from(dir));
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|name| std::env::var(name).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            // Logging is not up yet; its level comes from this file.
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => eprintln!("ignoring {}: {e}", p.display()),
                Err(e) => eprintln!("cannot read {}: {e}", p.display()),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.multicast_group, Ipv4Addr::new(229, 5, 38, 17));
        assert_eq!(c.chat_port, 50050);
        assert_eq!(c.private_chat_port, 50150);
        assert_eq!(c.transfer_port, 50250);
        assert_eq!(c.port_attempts, 10);
        assert_eq!(c.profile.own_color, lanchat_core::identity::DEFAULT_COLOR);
        assert_eq!(c.accept_timeout(), Duration::from_secs(15));
        assert_eq!(c.peer_timeout_secs, 120);
    }

    #[test]
    fn file_values_and_profile_table() {
        let c: Config = toml::from_str(
            r#"
            chat_port = 6000
            multicast_group = "239.1.2.3"
            download_dir = "/tmp/in"

            [profile]
            nick = "Anna"
            own_color = 255
            "#,
        )
        .unwrap();
        assert_eq!(c.chat_port, 6000);
        assert_eq!(c.multicast_group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(c.download_dir(), PathBuf::from("/tmp/in"));
        assert_eq!(c.profile.nick.as_deref(), Some("Anna"));
        assert_eq!(c.profile.own_color, 255);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("chat_prot = 1").is_err());
        assert!(toml::from_str::<Config>("[profile]\ncolour = 1").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("LANCHAT_NICK", "Bob"),
            ("LANCHAT_CHAT_PORT", "7000"),
            ("LANCHAT_PRIVATE_PORT", "not a port"),
            ("LANCHAT_DOWNLOAD_DIR", "/srv/dl"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.profile.nick.as_deref(), Some("Bob"));
        assert_eq!(c.chat_port, 7000);
        assert_eq!(c.private_chat_port, 50150);
        assert_eq!(c.transfer_port, 50250);
        assert_eq!(c.download_dir(), PathBuf::from("/srv/dl"));
    }
}
