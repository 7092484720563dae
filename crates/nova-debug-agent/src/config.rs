use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid jdwp option: {0}")]
    InvalidOption(String),
    #[error("invalid agent config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a source snippet; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "dt_socket")]
    Socket,
    /// The embedder hands the agent an already connected stream.
    #[serde(rename = "dt_embedded")]
    Embedded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JdwpOptions {
    #[serde(default)]
    pub transport: TransportKind,

    /// Listen for the debugger (`true`) or dial out to it.
    #[serde(default = "JdwpOptions::default_server")]
    pub server: bool,

    /// `host:port`; a bare port binds loopback and `*:port` binds every
    /// interface.
    #[serde(default = "JdwpOptions::default_address")]
    pub address: String,

    /// Hold every thread at VM start until the debugger resumes.
    #[serde(default)]
    pub suspend: bool,
}

impl JdwpOptions {
    fn default_server() -> bool {
        true
    }

    fn default_address() -> String {
        "127.0.0.1:8000".to_owned()
    }

    /// Parse the classic `-agentlib:jdwp=` option string, e.g.
    /// `transport=dt_socket,server=y,suspend=n,address=8000`.
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut parsed = Self::default();
        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidOption(format!("`{item}` is not key=value")))?;
            match key {
                "transport" => {
                    parsed.transport = match value {
                        "dt_socket" => TransportKind::Socket,
                        "dt_embedded" => TransportKind::Embedded,
                        other => {
                            return Err(ConfigError::InvalidOption(format!(
                                "unsupported transport `{other}`"
                            )))
                        }
                    }
                }
                "server" => parsed.server = parse_yes_no(key, value)?,
                "suspend" => parsed.suspend = parse_yes_no(key, value)?,
                "address" => parsed.address = normalize_address(value)?,
                "launch" | "onthrow" | "onuncaught" | "timeout" | "help" | "quiet" => {
                    tracing::warn!(target = "nova.jdwp", option = key, "ignoring unsupported jdwp option");
                }
                other => {
                    return Err(ConfigError::InvalidOption(format!("unknown option `{other}`")));
                }
            }
        }
        Ok(parsed)
    }
}

impl Default for JdwpOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            server: Self::default_server(),
            address: Self::default_address(),
            suspend: false,
        }
    }
}

fn parse_yes_no(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        other => Err(ConfigError::InvalidOption(format!(
            "`{key}` expects y or n, got `{other}`"
        ))),
    }
}

fn normalize_address(value: &str) -> Result<String, ConfigError> {
    let (host, port) = match value.rsplit_once(':') {
        Some(("*", port)) => ("0.0.0.0", port),
        Some((host, port)) => (host, port),
        None => ("127.0.0.1", value),
    };
    port.parse::<u16>()
        .map_err(|_| ConfigError::InvalidOption(format!("bad port in address `{value}`")))?;
    Ok(format!("{host}:{port}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    fn directives(&self) -> String {
        match self.level.trim() {
            "" => Self::default_level(),
            level if level.eq_ignore_ascii_case("warning") => "warn".to_owned(),
            level => level.to_owned(),
        }
    }

    /// The configured level with `RUST_LOG` appended when it is set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let mut directives = self.directives();
        if let Ok(env) = std::env::var("RUST_LOG") {
            if !env.trim().is_empty() {
                directives = format!("{directives},{}", env.trim());
            }
        }
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber. Only the first call has any
/// effect, so embedders that already installed one keep theirs.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Layer;

    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let layer: Box<dyn Layer<_> + Send + Sync> = match (config.stderr, config.json) {
            (false, _) => tracing_subscriber::layer::Identity::new().boxed(),
            (true, true) => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed(),
        };
        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocationTrackingConfig {
    /// Start tracking as soon as the agent is created.
    #[serde(default)]
    pub enabled: bool,

    /// Ring buffer size; must be a power of two.
    #[serde(default = "AllocationTrackingConfig::default_max_records")]
    pub max_records: usize,

    #[serde(default = "AllocationTrackingConfig::default_max_stack_depth")]
    pub max_stack_depth: usize,
}

impl AllocationTrackingConfig {
    fn default_max_records() -> usize {
        65_536
    }

    fn default_max_stack_depth() -> usize {
        16
    }
}

impl Default for AllocationTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_records: Self::default_max_records(),
            max_stack_depth: Self::default_max_stack_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub jdwp: JdwpOptions,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upper bound on every wait for threads to reach a safepoint.
    #[serde(default = "AgentConfig::default_suspend_timeout_ms")]
    pub suspend_timeout_ms: u64,

    #[serde(default = "AgentConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default)]
    pub allocation_tracking: AllocationTrackingConfig,

    /// Byte size of every JDWP identifier (4 or 8).
    #[serde(default = "AgentConfig::default_id_size")]
    pub id_size: usize,

    /// Reported by `VirtualMachine.Version`.
    #[serde(default = "AgentConfig::default_vm_name")]
    pub vm_name: String,

    #[serde(default = "AgentConfig::default_vm_version")]
    pub vm_version: String,
}

impl AgentConfig {
    fn default_suspend_timeout_ms() -> u64 {
        5_000
    }

    fn default_handshake_timeout_ms() -> u64 {
        10_000
    }

    fn default_id_size() -> usize {
        8
    }

    fn default_vm_name() -> String {
        "Nova VM".to_owned()
    }

    fn default_vm_version() -> String {
        env!("CARGO_PKG_VERSION").to_owned()
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: AgentConfig = toml::from_str(text)?;
        config.jdwp.address = normalize_address(&config.jdwp.address)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_size != 4 && self.id_size != 8 {
            return Err(ConfigError::Invalid(format!(
                "id_size must be 4 or 8, got {}",
                self.id_size
            )));
        }
        if self.suspend_timeout_ms == 0 {
            return Err(ConfigError::Invalid("suspend_timeout_ms must be positive".into()));
        }
        let records = self.allocation_tracking.max_records;
        if records == 0 || !records.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "allocation_tracking.max_records must be a power of two, got {records}"
            )));
        }
        Ok(())
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            jdwp: JdwpOptions::default(),
            logging: LoggingConfig::default(),
            suspend_timeout_ms: Self::default_suspend_timeout_ms(),
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            allocation_tracking: AllocationTrackingConfig::default(),
            id_size: Self::default_id_size(),
            vm_name: Self::default_vm_name(),
            vm_version: Self::default_vm_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agentlib_option_strings() {
        let options =
            JdwpOptions::parse("transport=dt_socket,server=y,suspend=n,address=8000").unwrap();
        assert_eq!(options.transport, TransportKind::Socket);
        assert!(options.server);
        assert!(!options.suspend);
        assert_eq!(options.address, "127.0.0.1:8000");

        let options = JdwpOptions::parse("server=n,address=*:5005,suspend=y,timeout=10").unwrap();
        assert!(!options.server);
        assert!(options.suspend);
        assert_eq!(options.address, "0.0.0.0:5005");
    }

    #[test]
    fn rejects_malformed_options() {
        assert!(matches!(
            JdwpOptions::parse("transport=dt_shmem"),
            Err(ConfigError::InvalidOption(_))
        ));
        assert!(matches!(
            JdwpOptions::parse("server=maybe"),
            Err(ConfigError::InvalidOption(_))
        ));
        assert!(matches!(
            JdwpOptions::parse("address=host:port"),
            Err(ConfigError::InvalidOption(_))
        ));
        assert!(matches!(
            JdwpOptions::parse("verbose"),
            Err(ConfigError::InvalidOption(_))
        ));
    }

    #[test]
    fn level_synonyms_are_normalized() {
        let level = |level: &str| LoggingConfig {
            level: level.to_owned(),
            ..LoggingConfig::default()
        };
        assert_eq!(level(" WARNING ").directives(), "warn");
        assert_eq!(level("").directives(), "info");
        assert_eq!(level("nova.jdwp=trace").directives(), "nova.jdwp=trace");
    }

    #[test]
    fn validate_rejects_bad_id_sizes_and_capacities() {
        let mut config = AgentConfig {
            id_size: 6,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.id_size = 4;
        config.allocation_tracking.max_records = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.allocation_tracking.max_records = 1024;
        assert!(config.validate().is_ok());
    }
}
