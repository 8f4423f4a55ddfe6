//! Node configuration loaded from environment variables.

use std::path::PathBuf;

/// Node configuration.
///
/// All fields have defaults suitable for a single-node farm in the
/// current directory; real deployments set the farm root to a shared
/// mount every node can reach.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Shared filesystem mount point the farm lives under.
    pub sync_root: PathBuf,
    /// Local (non-shared) directory for identity, the leader store, and
    /// the submission dropbox.
    pub data_dir: PathBuf,
    /// HTTP mesh port.
    pub http_port: u16,
    /// Advertised IP. `None` auto-detects the outbound interface.
    pub ip_override: Option<String>,
    /// Leader election priority (lower is preferred). Advertised to
    /// peers; not part of the election rank itself.
    pub priority: i32,
    /// Tags for job targeting and election (`leader` / `noleader`).
    pub tags: Vec<String>,
    /// UDP multicast on/off.
    pub udp_enabled: bool,
    pub udp_port: u16,
    /// Command line used to launch the side-car agent.
    pub agent_command: Vec<String>,
    /// Spawn the agent at startup rather than on first dispatch.
    pub auto_start_agent: bool,
    /// Render into a local staging directory, copy out on success.
    pub staging_enabled: bool,
    /// How long to wait for the agent's `ack` after `start_task`.
    pub ack_timeout_secs: u64,
}

impl NodeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default             |
    /// |-----------------------------|---------------------|
    /// | `MIDRENDER_SYNC_ROOT`       | `./farm`            |
    /// | `MIDRENDER_DATA_DIR`        | `./midrender-data`  |
    /// | `MIDRENDER_HTTP_PORT`       | `8420`              |
    /// | `MIDRENDER_IP`              | auto-detect         |
    /// | `MIDRENDER_PRIORITY`        | `100`               |
    /// | `MIDRENDER_TAGS`            | (none)              |
    /// | `MIDRENDER_UDP_ENABLED`     | `true`              |
    /// | `MIDRENDER_UDP_PORT`        | `4243`              |
    /// | `MIDRENDER_AGENT_CMD`       | `midrender-agent`   |
    /// | `MIDRENDER_AUTO_START_AGENT`| `true`              |
    /// | `MIDRENDER_STAGING`         | `false`             |
    /// | `MIDRENDER_ACK_TIMEOUT_SECS`| `15`                |
    pub fn from_env() -> Self {
        let sync_root = PathBuf::from(env_or("MIDRENDER_SYNC_ROOT", "./farm"));
        let data_dir = PathBuf::from(env_or("MIDRENDER_DATA_DIR", "./midrender-data"));

        let http_port: u16 = env_or("MIDRENDER_HTTP_PORT", "8420")
            .parse()
            .expect("MIDRENDER_HTTP_PORT must be a valid u16");

        let ip_override = std::env::var("MIDRENDER_IP").ok().filter(|s| !s.is_empty());

        let priority: i32 = env_or("MIDRENDER_PRIORITY", "100")
            .parse()
            .expect("MIDRENDER_PRIORITY must be an integer");

        let tags: Vec<String> = std::env::var("MIDRENDER_TAGS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let udp_enabled = env_or("MIDRENDER_UDP_ENABLED", "true") == "true";
        let udp_port: u16 = env_or("MIDRENDER_UDP_PORT", "4243")
            .parse()
            .expect("MIDRENDER_UDP_PORT must be a valid u16");

        let agent_command: Vec<String> = env_or("MIDRENDER_AGENT_CMD", "midrender-agent")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let auto_start_agent = env_or("MIDRENDER_AUTO_START_AGENT", "true") == "true";
        let staging_enabled = env_or("MIDRENDER_STAGING", "false") == "true";

        let ack_timeout_secs: u64 = env_or("MIDRENDER_ACK_TIMEOUT_SECS", "15")
            .parse()
            .expect("MIDRENDER_ACK_TIMEOUT_SECS must be an integer");

        Self {
            sync_root,
            data_dir,
            http_port,
            ip_override,
            priority,
            tags,
            udp_enabled,
            udp_port,
            agent_command,
            auto_start_agent,
            staging_enabled,
            ack_timeout_secs,
        }
    }

    /// A config suitable for tests: everything under `root`, UDP off,
    /// agent never auto-started.
    pub fn for_test(root: &std::path::Path) -> Self {
        Self {
            sync_root: root.join("sync"),
            data_dir: root.join("data"),
            http_port: 0,
            ip_override: Some("127.0.0.1".into()),
            priority: 100,
            tags: Vec::new(),
            udp_enabled: false,
            udp_port: 0,
            agent_command: vec!["/bin/cat".into()],
            auto_start_agent: false,
            staging_enabled: false,
            ack_timeout_secs: 2,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
