//! SFU service configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default, so an empty environment yields a runnable single-worker server.

use crate::engine::codecs::default_media_codecs;
use crate::engine::{ListenIp, WebRtcTransportOptions, WorkerSettings};
use common::media::RtpCodecCapability;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (HTTP + WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:5000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default number of media workers.
pub const DEFAULT_NUM_WORKERS: usize = 1;

/// Default worker RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 2000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 2020;

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default IP announced in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default respawn attempts before a worker death becomes fatal.
pub const DEFAULT_WORKER_RESPAWN_ATTEMPTS: u32 = 3;

/// Default linear backoff step between respawn attempts in milliseconds.
pub const DEFAULT_WORKER_RESPAWN_BACKOFF_MS: u64 = 500;

/// Default grace period before a fatal worker failure exits the process.
pub const DEFAULT_WORKER_EXIT_GRACE_MS: u64 = 2000;

/// Default registry capacity.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default room capacity.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 100;

/// Default room for clients that never send `joinRoom`.
pub const DEFAULT_ROOM: &str = "default";

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// What the worker pool does when a media worker dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerDeathPolicy {
    /// Replace the worker, retrying a bounded number of times before
    /// escalating to process exit.
    Respawn,
    /// Exit the process after the grace period.
    Exit,
}

impl WorkerDeathPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            WorkerDeathPolicy::Respawn => "respawn",
            WorkerDeathPolicy::Exit => "exit",
        }
    }
}

impl FromStr for WorkerDeathPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "respawn" => Ok(WorkerDeathPolicy::Respawn),
            "exit" => Ok(WorkerDeathPolicy::Exit),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_WORKER_DEATH_POLICY must be 'respawn' or 'exit', got '{other}'"
            ))),
        }
    }
}

/// SFU service configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling server bind address (default: "0.0.0.0:5000").
    pub signaling_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// Media workers in the pool.
    pub num_workers: usize,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// IP the transports listen on.
    pub listen_ip: String,

    /// Public IP advertised in ICE candidates.
    pub announced_ip: Option<String>,

    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,

    /// Codecs every router is created with.
    pub media_codecs: Vec<RtpCodecCapability>,

    pub worker_death_policy: WorkerDeathPolicy,
    pub worker_respawn_attempts: u32,
    pub worker_respawn_backoff: Duration,
    pub worker_exit_grace: Duration,

    pub max_rooms: usize,
    pub max_peers_per_room: usize,

    /// Room joined implicitly by clients that skip `joinRoom`.
    pub default_room: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("sfu_id", &self.sfu_id)
            .field("num_workers", &self.num_workers)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("enable_udp", &self.enable_udp)
            .field("enable_tcp", &self.enable_tcp)
            .field("prefer_udp", &self.prefer_udp)
            .field("media_codecs", &self.media_codecs.len())
            .field("worker_death_policy", &self.worker_death_policy.as_str())
            .field("worker_respawn_attempts", &self.worker_respawn_attempts)
            .field("worker_respawn_backoff", &self.worker_respawn_backoff)
            .field("worker_exit_grace", &self.worker_exit_grace)
            .field("max_rooms", &self.max_rooms)
            .field("max_peers_per_room", &self.max_peers_per_room)
            .field("default_room", &self.default_room)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers: usize = parse_var(vars, "SFU_NUM_WORKERS", DEFAULT_NUM_WORKERS)?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let rtc_min_port: u16 = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port: u16 = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) must not exceed SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = vars
            .get("SFU_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LISTEN_IP.to_string());

        // An empty value disables the announced IP
        let announced_ip = match vars.get("SFU_ANNOUNCED_IP") {
            Some(ip) if ip.trim().is_empty() => None,
            Some(ip) => Some(ip.trim().to_string()),
            None => Some(DEFAULT_ANNOUNCED_IP.to_string()),
        };

        let enable_udp = parse_bool(vars, "SFU_ENABLE_UDP", true)?;
        let enable_tcp = parse_bool(vars, "SFU_ENABLE_TCP", true)?;
        let prefer_udp = parse_bool(vars, "SFU_PREFER_UDP", true)?;
        if !enable_udp && !enable_tcp {
            return Err(ConfigError::InvalidValue(
                "at least one of SFU_ENABLE_UDP and SFU_ENABLE_TCP must be true".to_string(),
            ));
        }

        let media_codecs = match vars.get("SFU_MEDIA_CODECS") {
            Some(json) => {
                let codecs: Vec<RtpCodecCapability> = serde_json::from_str(json).map_err(|e| {
                    ConfigError::InvalidValue(format!("SFU_MEDIA_CODECS is not valid JSON: {e}"))
                })?;
                if codecs.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "SFU_MEDIA_CODECS must list at least one codec".to_string(),
                    ));
                }
                codecs
            }
            None => default_media_codecs(),
        };

        let worker_death_policy = match vars.get("SFU_WORKER_DEATH_POLICY") {
            Some(value) => value.parse()?,
            None => WorkerDeathPolicy::Respawn,
        };

        let worker_respawn_attempts = parse_var(
            vars,
            "SFU_WORKER_RESPAWN_ATTEMPTS",
            DEFAULT_WORKER_RESPAWN_ATTEMPTS,
        )?;

        let worker_respawn_backoff = Duration::from_millis(parse_var(
            vars,
            "SFU_WORKER_RESPAWN_BACKOFF_MS",
            DEFAULT_WORKER_RESPAWN_BACKOFF_MS,
        )?);

        let worker_exit_grace = Duration::from_millis(parse_var(
            vars,
            "SFU_WORKER_EXIT_GRACE_MS",
            DEFAULT_WORKER_EXIT_GRACE_MS,
        )?);

        let max_rooms = parse_var(vars, "SFU_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        let max_peers_per_room =
            parse_var(vars, "SFU_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?;

        let default_room = match vars.get("SFU_DEFAULT_ROOM") {
            Some(room) if room.trim().is_empty() => None,
            Some(room) => Some(room.trim().to_string()),
            None => Some(DEFAULT_ROOM.to_string()),
        };

        // Generate SFU instance ID
        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            sfu_id,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            enable_udp,
            enable_tcp,
            prefer_udp,
            media_codecs,
            worker_death_policy,
            worker_respawn_attempts,
            worker_respawn_backoff,
            worker_exit_grace,
            max_rooms,
            max_peers_per_room,
            default_room,
        })
    }

    /// Settings every pooled worker is spawned with.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Listen policy for WebRTC transports.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: self.listen_ip.clone(),
                announced_ip: self.announced_ip.clone(),
            }],
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} has invalid value '{value}'"))),
        None => Ok(default),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(value) => match value.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!(
                "{key} must be a boolean, got '{value}'"
            ))),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::media::MediaKind;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.num_workers, 1);
        assert_eq!(config.rtc_min_port, 2000);
        assert_eq!(config.rtc_max_port, 2020);
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.announced_ip.as_deref(), Some("127.0.0.1"));
        assert!(config.enable_udp && config.enable_tcp && config.prefer_udp);
        assert_eq!(config.media_codecs, default_media_codecs());
        assert_eq!(config.worker_death_policy, WorkerDeathPolicy::Respawn);
        assert_eq!(config.worker_respawn_attempts, 3);
        assert_eq!(config.worker_respawn_backoff, Duration::from_millis(500));
        assert_eq!(config.worker_exit_grace, Duration::from_millis(2000));
        assert_eq!(config.max_rooms, 1000);
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.default_room.as_deref(), Some("default"));
        // SFU ID should be auto-generated
        assert!(config.sfu_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SFU_SIGNALING_BIND_ADDRESS", "127.0.0.1:3016"),
            ("SFU_ID", "sfu-custom-001"),
            ("SFU_NUM_WORKERS", "4"),
            ("SFU_RTC_MIN_PORT", "40000"),
            ("SFU_RTC_MAX_PORT", "49999"),
            ("SFU_ANNOUNCED_IP", "203.0.113.7"),
            ("SFU_ENABLE_TCP", "false"),
            ("SFU_WORKER_DEATH_POLICY", "exit"),
            ("SFU_WORKER_EXIT_GRACE_MS", "250"),
            ("SFU_MAX_PEERS_PER_ROOM", "8"),
            ("SFU_DEFAULT_ROOM", "lobby"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:3016");
        assert_eq!(config.sfu_id, "sfu-custom-001");
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.worker_settings().rtc_min_port, 40000);
        assert_eq!(config.worker_settings().rtc_max_port, 49999);
        assert!(!config.enable_tcp);
        assert_eq!(config.worker_death_policy, WorkerDeathPolicy::Exit);
        assert_eq!(config.worker_exit_grace, Duration::from_millis(250));
        assert_eq!(config.max_peers_per_room, 8);
        assert_eq!(config.default_room.as_deref(), Some("lobby"));

        let options = config.transport_options();
        assert_eq!(options.listen_ips.len(), 1);
        assert_eq!(
            options.listen_ips.first().unwrap().announced_ip.as_deref(),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn test_empty_values_disable_optional_settings() {
        let config =
            Config::from_vars(&vars(&[("SFU_ANNOUNCED_IP", ""), ("SFU_DEFAULT_ROOM", " ")]))
                .unwrap();
        assert!(config.announced_ip.is_none());
        assert!(config.default_room.is_none());
    }

    #[test]
    fn test_media_codecs_from_json() {
        let config = Config::from_vars(&vars(&[(
            "SFU_MEDIA_CODECS",
            r#"[{"kind":"video","mimeType":"video/H264","clockRate":90000,
                "parameters":{"packetization-mode":1,"profile-level-id":"42e01f"}}]"#,
        )]))
        .unwrap();

        assert_eq!(config.media_codecs.len(), 1);
        let codec = config.media_codecs.first().unwrap();
        assert_eq!(codec.kind, MediaKind::Video);
        assert_eq!(codec.mime_type, "video/H264");
        assert_eq!(codec.parameters["packetization-mode"], 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            ("SFU_NUM_WORKERS", "0"),
            ("SFU_NUM_WORKERS", "many"),
            ("SFU_RTC_MIN_PORT", "70000"),
            ("SFU_MEDIA_CODECS", "not json"),
            ("SFU_MEDIA_CODECS", "[]"),
            ("SFU_WORKER_DEATH_POLICY", "ignore"),
            ("SFU_PREFER_UDP", "maybe"),
        ];

        for (key, value) in cases {
            let result = Config::from_vars(&vars(&[(key, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let result = Config::from_vars(&vars(&[
            ("SFU_RTC_MIN_PORT", "3000"),
            ("SFU_RTC_MAX_PORT", "2000"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("SFU_RTC_MIN_PORT")));
    }

    #[test]
    fn test_udp_and_tcp_cannot_both_be_disabled() {
        let result = Config::from_vars(&vars(&[
            ("SFU_ENABLE_UDP", "false"),
            ("SFU_ENABLE_TCP", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
