//! Data structures and helper methods around influencing the configuration
//! of the server.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ini::{Ini, Properties};
use url::Url;

use crate::auth::Identity;
use crate::types::UserId;

pub const DEFAULT_CONFIG_FILE: &str = "coedit.conf";
pub const DEFAULT_PORT: u16 = 7430;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Origins the (external) HTTP layer may accept; parsed here so one
    /// config file drives the whole deployment.
    pub allowed_origins: Vec<String>,
    pub store_url: Url,
    pub auth_provider_url: Option<Url>,
    /// Static bearer tokens for [`crate::auth::StaticTokenAuth`].
    pub tokens: Vec<(String, Identity)>,
    pub limits: Limits,
    pub ttls: Ttls,
}

#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum tolerated `current_version - base_version` before a client
    /// is forced to re-sync.
    pub max_lag: u64,
    /// Recent operations cached in memory per live document.
    pub op_ring_size: usize,
    pub operations_per_second: u32,
    pub operation_burst: u32,
    pub cursor_interval: Duration,
    pub presence_interval: Duration,
    pub max_message_bytes: usize,
    pub max_bundle_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_lag: 100,
            op_ring_size: 256,
            operations_per_second: 50,
            operation_burst: 200,
            cursor_interval: Duration::from_millis(100),
            presence_interval: Duration::from_secs(1),
            max_message_bytes: 1024 * 1024,
            max_bundle_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ttls {
    pub room_idle: Duration,
    pub session_idle: Duration,
    pub presence: Duration,
    pub join_deadline: Duration,
    pub store_deadline: Duration,
    /// How long a participant stays online after its last connection
    /// closed, so a quick reconnect does not flap presence.
    pub leave_grace: Duration,
}

impl Default for Ttls {
    fn default() -> Self {
        Self {
            room_idle: Duration::from_secs(60),
            session_idle: Duration::from_secs(60),
            presence: Duration::from_secs(300),
            join_deadline: Duration::from_secs(5),
            store_deadline: Duration::from_secs(10),
            leave_grace: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            store_url: Url::parse("memory://local").expect("default store URL is well-formed"),
            auth_provider_url: None,
            tokens: Vec::new(),
            limits: Limits::default(),
            ttls: Ttls::default(),
        }
    }
}

impl Config {
    /// Loads the config file, or returns the defaults when `path` is `None`
    /// and the default file does not exist. An explicitly given path must
    /// exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} does not exist", path.display());
                }
                Self::from_file(path)
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self> {
        let mut config = Self::default();

        if let Some(server) = ini.section(Some("server")) {
            if let Some(host) = server.get("host") {
                config.host = host.to_string();
            }
            if let Some(port) = server.get("port") {
                config.port = port
                    .parse()
                    .context("failed to parse config parameter `server.port`")?;
            }
            if let Some(origins) = server.get("allowed_origins") {
                config.allowed_origins = origins
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }

        if let Some(store) = ini.section(Some("store")) {
            if let Some(url) = store.get("url") {
                config.store_url = Url::parse(url)
                    .context("failed to parse config parameter `store.url`")?;
            }
        }

        if let Some(auth) = ini.section(Some("auth")) {
            if let Some(url) = auth.get("provider_url") {
                config.auth_provider_url = Some(
                    Url::parse(url).context("failed to parse config parameter `auth.provider_url`")?,
                );
            }
        }

        if let Some(tokens) = ini.section(Some("tokens")) {
            for (token, target) in tokens.iter() {
                let (user_id, display_name) = target
                    .split_once(':')
                    .unwrap_or((target, target));
                config.tokens.push((
                    token.to_string(),
                    Identity {
                        user_id: UserId::new(user_id),
                        display_name: display_name.to_string(),
                        avatar_url: None,
                    },
                ));
            }
        }

        if let Some(limits) = ini.section(Some("limits")) {
            read_u64(limits, "max_lag", &mut config.limits.max_lag)?;
            read_usize(limits, "op_ring_size", &mut config.limits.op_ring_size)?;
            read_u32(
                limits,
                "operations_per_second",
                &mut config.limits.operations_per_second,
            )?;
            read_u32(limits, "operation_burst", &mut config.limits.operation_burst)?;
            read_millis(limits, "cursor_interval_ms", &mut config.limits.cursor_interval)?;
            read_millis(
                limits,
                "presence_interval_ms",
                &mut config.limits.presence_interval,
            )?;
            read_usize(limits, "max_message_bytes", &mut config.limits.max_message_bytes)?;
            read_usize(limits, "max_bundle_bytes", &mut config.limits.max_bundle_bytes)?;
        }

        if let Some(ttl) = ini.section(Some("ttl")) {
            read_secs(ttl, "room_idle_secs", &mut config.ttls.room_idle)?;
            read_secs(ttl, "session_idle_secs", &mut config.ttls.session_idle)?;
            read_secs(ttl, "presence_ttl_secs", &mut config.ttls.presence)?;
            read_secs(ttl, "join_deadline_secs", &mut config.ttls.join_deadline)?;
            read_secs(ttl, "store_deadline_secs", &mut config.ttls.store_deadline)?;
            read_secs(ttl, "leave_grace_secs", &mut config.ttls.leave_grace)?;
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the configured store runs in-process.
    pub fn uses_memory_store(&self) -> bool {
        self.store_url.scheme() == "memory"
    }
}

fn read_u64(section: &Properties, key: &str, slot: &mut u64) -> Result<()> {
    if let Some(value) = section.get(key) {
        *slot = value
            .parse()
            .with_context(|| format!("failed to parse config parameter `{key}`"))?;
    }
    Ok(())
}

fn read_u32(section: &Properties, key: &str, slot: &mut u32) -> Result<()> {
    if let Some(value) = section.get(key) {
        *slot = value
            .parse()
            .with_context(|| format!("failed to parse config parameter `{key}`"))?;
    }
    Ok(())
}

fn read_usize(section: &Properties, key: &str, slot: &mut usize) -> Result<()> {
    if let Some(value) = section.get(key) {
        *slot = value
            .parse()
            .with_context(|| format!("failed to parse config parameter `{key}`"))?;
    }
    Ok(())
}

fn read_millis(section: &Properties, key: &str, slot: &mut Duration) -> Result<()> {
    if let Some(value) = section.get(key) {
        let millis: u64 = value
            .parse()
            .with_context(|| format!("failed to parse config parameter `{key}`"))?;
        *slot = Duration::from_millis(millis);
    }
    Ok(())
}

fn read_secs(section: &Properties, key: &str, slot: &mut Duration) -> Result<()> {
    if let Some(value) = section.get(key) {
        let secs: u64 = value
            .parse()
            .with_context(|| format!("failed to parse config parameter `{key}`"))?;
        *slot = Duration::from_secs(secs);
    }
    Ok(())
}
