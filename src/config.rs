//! Server-side configuration surface.
//!
//! Only the knobs the protocol runtime consumes live here; loading
//! them from files or the environment, and the listen/TLS settings of
//! the HTTP front, belong to the embedder. All timeouts come with the
//! gateway defaults and can be deserialized from any serde format.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;

use crate::dial::{Dialer, Socks5Config};

fn default_initial_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(1)
}

/// A configured backend target, optionally enforced as an allow-list.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Preset {
    /// Display title.
    pub title: String,

    /// Command type name, `"SSH"` or `"Telnet"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Target as `host` or `host:port`.
    pub host: String,

    /// Free-form metadata forwarded to the frontend.
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl Preset {
    /// The target normalized to `host:port`, filling in the default
    /// port of the preset's command type (SSH 22, Telnet 23).
    pub fn host_port(&self) -> String {
        let default_port = match self.kind.as_str() {
            "Telnet" => 23,
            _ => 22,
        };
        if self.host.starts_with('[') {
            if self.host.contains("]:") {
                return self.host.clone();
            }
            return format!("{}:{}", self.host, default_port);
        }
        match self.host.matches(':').count() {
            0 => format!("{}:{}", self.host, default_port),
            1 => self.host.clone(),
            // A bare IPv6 address needs brackets before a port.
            _ => format!("[{}]:{}", self.host, default_port),
        }
    }
}

/// The protocol runtime's configuration knobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public host name of the gateway.
    pub host_name: String,

    /// The shared secret for the auth handshake; when empty, each
    /// session falls back to its own random key.
    pub shared_key: Option<String>,

    /// How long the transport handshake may take.
    pub initial_timeout: Duration,

    /// Inbound idle limit; exceeding it tears the session.
    pub read_timeout: Duration,

    /// Outbound write limit; zero means "same as read".
    pub write_timeout: Duration,

    /// How often the client is expected to heartbeat; capped at 70% of
    /// the read timeout.
    pub heartbeat_timeout: Duration,

    /// Artificial pause before each inbound frame, for rate shaping.
    pub read_delay: Duration,

    /// Artificial pause after each outbound stream write.
    pub write_delay: Duration,

    /// Timeout for one backend dial attempt.
    pub dial_timeout: Duration,

    /// Timeout for one hook run.
    pub hook_timeout: Duration,

    /// SOCKS5 proxy address; when set, backend dials chain through it.
    pub socks5: Option<String>,

    /// SOCKS5 username.
    pub socks5_user: Option<String>,

    /// SOCKS5 password.
    pub socks5_password: Option<String>,

    /// Configured backend targets.
    pub presets: Vec<Preset>,

    /// Refuse any backend address not in the preset list.
    pub only_allow_preset_remotes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            shared_key: None,
            initial_timeout: default_initial_timeout(),
            read_timeout: default_read_timeout(),
            write_timeout: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            dial_timeout: default_dial_timeout(),
            hook_timeout: default_hook_timeout(),
            socks5: None,
            socks5_user: None,
            socks5_password: None,
            presets: Vec::new(),
            only_allow_preset_remotes: false,
        }
    }
}

impl ServerConfig {
    /// The effective write timeout: the configured one, or the read
    /// timeout when unset.
    pub fn effective_write_timeout(&self) -> Duration {
        if self.write_timeout.is_zero() {
            self.read_timeout
        } else {
            self.write_timeout
        }
    }

    /// The effective heartbeat interval: the configured one capped at
    /// 70% of the read timeout, which is also the default.
    pub fn effective_heartbeat_timeout(&self) -> Duration {
        let cap = self.read_timeout.mul_f64(0.7);
        if self.heartbeat_timeout.is_zero() || self.heartbeat_timeout > cap {
            cap
        } else {
            self.heartbeat_timeout
        }
    }

    /// The preset allow-list, when enforcement is on.
    pub fn allowed_hosts(&self) -> Option<HashSet<String>> {
        if !self.only_allow_preset_remotes {
            return None;
        }
        Some(self.presets.iter().map(Preset::host_port).collect())
    }

    /// Builds the backend dialer from the SOCKS5 settings and the
    /// allow-list.
    pub fn dialer(&self) -> Dialer {
        let socks5 = self.socks5.as_ref().map(|address| Socks5Config {
            address: address.clone(),
            user: self.socks5_user.clone(),
            password: self.socks5_password.clone(),
        });
        Dialer::new(socks5, self.allowed_hosts())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn preset(kind: &str, host: &str) -> Preset {
        Preset {
            title: host.to_owned(),
            kind: kind.to_owned(),
            host: host.to_owned(),
            meta: HashMap::new(),
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.initial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.read_timeout, Duration::from_secs(60));
        assert_eq!(cfg.effective_write_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.dial_timeout, Duration::from_secs(5));
        assert_eq!(cfg.hook_timeout, Duration::from_secs(1));
        assert!(!cfg.only_allow_preset_remotes);
    }

    #[test]
    fn test_heartbeat_capped() {
        let cfg = ServerConfig {
            heartbeat_timeout: Duration::from_secs(120),
            ..Default::default()
        };
        assert_eq!(cfg.effective_heartbeat_timeout(), Duration::from_secs(42));

        let cfg = ServerConfig {
            heartbeat_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(cfg.effective_heartbeat_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_preset_host_port() {
        assert_eq!(preset("SSH", "host.example").host_port(), "host.example:22");
        assert_eq!(preset("Telnet", "host.example").host_port(), "host.example:23");
        assert_eq!(preset("SSH", "host.example:2222").host_port(), "host.example:2222");
    }

    #[test]
    fn test_allowed_hosts_only_when_enforced() {
        let mut cfg = ServerConfig {
            presets: vec![preset("SSH", "a.example"), preset("Telnet", "b.example:2323")],
            ..Default::default()
        };
        assert!(cfg.allowed_hosts().is_none());

        cfg.only_allow_preset_remotes = true;
        let allowed = cfg.allowed_hosts().unwrap();
        assert!(allowed.contains("a.example:22"));
        assert!(allowed.contains("b.example:2323"));
        assert_eq!(allowed.len(), 2);
    }
}
