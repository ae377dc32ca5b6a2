use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Converse real-time server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "converse-server", version, about = "Converse real-time fanout server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CONVERSE_PORT", default_value = "8081")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CONVERSE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./converse.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "CONVERSE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Redis connection URL (shared session/presence backend and pub/sub bus)
    #[arg(long, env = "CONVERSE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// HMAC secret for validating access tokens (issued by the auth service)
    #[arg(long, env = "CONVERSE_JWT_SECRET", default_value = "")]
    pub jwt_secret: String,

    /// Allowed WebSocket origins (comma-separated). Empty or unlisted
    /// origins are rejected at upgrade time.
    #[arg(
        long,
        env = "CONVERSE_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values_t = default_allowed_origins()
    )]
    pub allowed_origins: Vec<String>,

    /// Hub tuning (loaded from [hubs] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub hubs: HubsConfig,

    /// Keepalive tuning (loaded from [keepalive] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Presence TTL in seconds (heartbeat expiry window)
    #[arg(long, env = "CONVERSE_PRESENCE_TTL_SECS", default_value = "300")]
    pub presence_ttl_secs: u64,

    /// Interval in seconds between shared-backend health checks
    #[arg(long, env = "CONVERSE_HEALTH_CHECK_INTERVAL_SECS", default_value = "15")]
    pub health_check_interval_secs: u64,
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:8080".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:8080".to_string(),
    ]
}

/// Per-hub connection caps and queue depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubsConfig {
    /// Maximum concurrent chat connections (unset = unlimited)
    #[serde(default)]
    pub max_chat_connections: Option<usize>,

    /// Maximum concurrent signaling connections (unset = unlimited)
    #[serde(default)]
    pub max_signaling_connections: Option<usize>,

    /// Maximum concurrent poll connections (default: 1000)
    #[serde(default = "default_max_poll_connections")]
    pub max_poll_connections: Option<usize>,

    /// Per-connection outbound queue depth; a full queue disconnects the
    /// slow consumer (default: 256)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for HubsConfig {
    fn default() -> Self {
        Self {
            max_chat_connections: None,
            max_signaling_connections: None,
            max_poll_connections: Some(1000),
            queue_depth: 256,
        }
    }
}

fn default_max_poll_connections() -> Option<usize> {
    Some(1000)
}

fn default_queue_depth() -> usize {
    256
}

/// WebSocket keepalive windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Interval in seconds between server pings (default: 54)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Close the connection after this many seconds without any client
    /// traffic, pongs included (default: 60)
    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 54,
            read_deadline_secs: 60,
        }
    }
}

fn default_ping_interval() -> u64 {
    54
}

fn default_read_deadline() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8081,
            bind_address: "0.0.0.0".to_string(),
            config: "./converse.toml".to_string(),
            json_logs: false,
            generate_config: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            jwt_secret: String::new(),
            allowed_origins: default_allowed_origins(),
            hubs: HubsConfig::default(),
            keepalive: KeepaliveConfig::default(),
            presence_ttl_secs: 300,
            health_check_interval_secs: 15,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CONVERSE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CONVERSE_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Converse Real-time Server Configuration
# Place this file at ./converse.toml or specify with --config <path>
# All settings can be overridden via environment variables (CONVERSE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8081)
# port = 8081

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Redis URL: shared session/presence backend and cross-replica pub/sub bus.
# The server starts (degraded) even when Redis is unreachable; session and
# presence state fall back to an in-process cache until Redis recovers.
# redis_url = "redis://127.0.0.1:6379"

# HMAC secret shared with the auth service that issues access tokens
# jwt_secret = ""

# WebSocket origin allow-list. Upgrades with a missing or unlisted
# Origin header are rejected.
# allowed_origins = ["http://localhost:3000", "http://localhost:8080"]

# Presence heartbeat expiry in seconds (default: 300)
# presence_ttl_secs = 300

# Seconds between Redis health checks (default: 15)
# health_check_interval_secs = 15

# ---- Hub tuning ----
# [hubs]

# Connection caps per hub; exceeding a cap rejects the upgrade with 503.
# Unset means unlimited.
# max_chat_connections = 10000
# max_signaling_connections = 10000
# max_poll_connections = 1000

# Per-connection outbound queue depth. A consumer that lets its queue
# fill is disconnected rather than stalling the hub (default: 256).
# queue_depth = 256

# ---- Keepalive ----
# [keepalive]

# Interval between server pings in seconds (default: 54)
# ping_interval_secs = 54

# Close after this many seconds of client silence (default: 60)
# read_deadline_secs = 60
"#
    .to_string()
}
