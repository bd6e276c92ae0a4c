use clap::{Arg, ArgMatches, Command};
use clap::parser::ValueSource;
use serde_json::{Map, Value};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::debug;

use crate::error::{AgentError, Result};

// Default values as constants
pub const DEFAULT_CONFIG_PATH: &str = "../config.iot";
pub const DEFAULT_PORT: u16 = 8883;
pub const DEFAULT_IS_SAS: bool = true;
pub const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 10000;
pub const DEFAULT_RETRY_TIMEOUT_LIMIT_SECS: u64 = 100;
pub const DEFAULT_SYSLOG_FACILITY: &str = "user";
pub const DEFAULT_CA_CERT_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";
pub const DEFAULT_VERBOSE: bool = false;

// Keys of the config document
pub const KEY_HUB_HOST_NAME: &str = "hubHostName";
pub const KEY_DEVICE_ID: &str = "deviceId";
pub const KEY_IS_SAS: &str = "isSas";
pub const KEY_SAS_TOKEN: &str = "sasToken";
pub const KEY_CA_CERT_PATH: &str = "caCertPath";
pub const KEY_CLIENT_CERT_PATH: &str = "clientCertPath";
pub const KEY_CLIENT_KEY_PATH: &str = "clientKeyPath";
pub const KEY_PORT: &str = "port";
pub const KEY_TELEMETRY_INTERVAL_SECS: &str = "telemetryIntervalSecs";
pub const KEY_MESSAGE_TIMEOUT_MS: &str = "messageTimeoutMs";
pub const KEY_RETRY_TIMEOUT_LIMIT_SECS: &str = "retryTimeoutLimitSecs";
pub const KEY_SYSLOG_FACILITY: &str = "syslogFacility";
pub const KEY_LOG_FILE: &str = "logFile";
pub const KEY_VERBOSE: &str = "verbose";

// String representations for numeric defaults (for clap)
const DEFAULT_TELEMETRY_INTERVAL_STR: &str = "60";

/// The persisted JSON configuration document.
///
/// Read fully on load and written fully on save; there is no merge with
/// what is on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    document: Map<String, Value>,
}

impl ConfigStore {
    /// Empty document bound to `path`; nothing is read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: Map::new(),
        }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|source| AgentError::ConfigIo {
            path: path.clone(),
            source,
        })?;

        let document = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(AgentError::ConfigParse {
                    path,
                    reason: format!("top level must be an object, found {}", json_kind(&other)),
                });
            }
            Err(e) => {
                return Err(AgentError::ConfigParse {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        Ok(Self { path, document })
    }

    pub fn save(&self) -> Result<()> {
        let content = self.to_pretty_string();
        std::fs::write(&self.path, content).map_err(|source| AgentError::ConfigIo {
            path: self.path.clone(),
            source,
        })
    }

    /// Log the whole document at debug level.
    pub fn dump(&self) {
        debug!("{}", self.to_pretty_string());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.document.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.document.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.document.get(key).and_then(Value::as_bool)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.document.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.document.shift_remove(key)
    }

    /// Pretty-printed with a 4-space indent and keys sorted at every level.
    fn to_pretty_string(&self) -> String {
        let sorted = sort_keys(&Value::Object(self.document.clone()));
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        // Serializing a Value into a Vec cannot fail
        if sorted.serialize(&mut serializer).is_err() {
            return String::new();
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// How the device authenticates against the hub
#[derive(Debug, Clone, PartialEq)]
pub enum Security {
    Sas { token: String },
    X509 { cert_path: PathBuf, key_path: PathBuf },
}

impl Security {
    pub fn name(&self) -> &'static str {
        match self {
            Security::Sas { .. } => "SAS",
            Security::X509 { .. } => "X509",
        }
    }
}

/// Runtime configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub config_path: PathBuf,
    pub hub_host_name: String,
    pub device_id: String,
    pub port: u16,
    pub security: Security,
    pub ca_cert_path: PathBuf,
    pub telemetry_interval: Duration,
    pub message_timeout: Duration,
    pub retry_timeout_limit: Duration,
    pub syslog_facility: String,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

/// Macro to copy command line values into the config document
macro_rules! override_if_present {
    // For string values
    ($matches:expr, $option:expr, $store:expr, $key:expr, string) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            if let Some(value) = $matches.get_one::<String>($option) {
                $store.set($key, value.to_string());
            }
        }
    };

    // For boolean flags with 'no-' version
    ($matches:expr, $option:expr, $store:expr, $key:expr, flag-yn) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            $store.set($key, true);
        } else if $matches.value_source(concat!("no-", $option)) == Some(ValueSource::CommandLine) {
            $store.set($key, false);
        }
    };

    // For parsed values
    ($matches:expr, $option:expr, $store:expr, $key:expr, $type:ty) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            if let Some(value) = $matches.get_one::<String>($option) {
                if let Ok(parsed) = value.parse::<$type>() {
                    $store.set($key, parsed);
                }
            }
        }
    };
}

/// Builder for merging the config document and the command line
pub struct ConfigBuilder {
    store: ConfigStore,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            store: ConfigStore::new(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn load_config_file(mut self, path: &str) -> Result<Self> {
        self.store = ConfigStore::read(path)?;
        Ok(self)
    }

    pub fn merge_command_line(mut self, matches: &ArgMatches) -> Self {
        override_if_present!(matches, "hub", self.store, KEY_HUB_HOST_NAME, string);
        override_if_present!(matches, "device-id", self.store, KEY_DEVICE_ID, string);
        override_if_present!(matches, "sas-token", self.store, KEY_SAS_TOKEN, string);
        override_if_present!(matches, "ca-cert", self.store, KEY_CA_CERT_PATH, string);
        override_if_present!(matches, "client-cert", self.store, KEY_CLIENT_CERT_PATH, string);
        override_if_present!(matches, "client-key", self.store, KEY_CLIENT_KEY_PATH, string);
        override_if_present!(matches, "syslog-facility", self.store, KEY_SYSLOG_FACILITY, string);
        override_if_present!(matches, "log-file", self.store, KEY_LOG_FILE, string);

        override_if_present!(matches, "port", self.store, KEY_PORT, u16);
        override_if_present!(matches, "telemetry-interval", self.store, KEY_TELEMETRY_INTERVAL_SECS, u64);

        override_if_present!(matches, "verbose", self.store, KEY_VERBOSE, flag-yn);

        // --x509 / --sas pick the security mode
        if matches.value_source("x509") == Some(ValueSource::CommandLine) {
            self.store.set(KEY_IS_SAS, false);
        } else if matches.value_source("sas") == Some(ValueSource::CommandLine) {
            self.store.set(KEY_IS_SAS, true);
        }

        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn into_store(self) -> ConfigStore {
        self.store
    }

    pub fn build(&self) -> Result<AgentConfig> {
        let store = &self.store;
        let missing = |key: &str| AgentError::ConfigParse {
            path: store.path().to_path_buf(),
            reason: format!("missing required key '{}'", key),
        };

        let hub_host_name = store.get_str(KEY_HUB_HOST_NAME)
            .ok_or_else(|| missing(KEY_HUB_HOST_NAME))?
            .to_string();
        let device_id = store.get_str(KEY_DEVICE_ID)
            .ok_or_else(|| missing(KEY_DEVICE_ID))?
            .to_string();

        let security = if store.get_bool(KEY_IS_SAS).unwrap_or(DEFAULT_IS_SAS) {
            Security::Sas {
                token: store.get_str(KEY_SAS_TOKEN)
                    .ok_or_else(|| missing(KEY_SAS_TOKEN))?
                    .to_string(),
            }
        } else {
            Security::X509 {
                cert_path: store.get_str(KEY_CLIENT_CERT_PATH)
                    .map(PathBuf::from)
                    .ok_or_else(|| missing(KEY_CLIENT_CERT_PATH))?,
                key_path: store.get_str(KEY_CLIENT_KEY_PATH)
                    .map(PathBuf::from)
                    .ok_or_else(|| missing(KEY_CLIENT_KEY_PATH))?,
            }
        };

        let port = match store.get_u64(KEY_PORT) {
            Some(port) => u16::try_from(port).map_err(|_| AgentError::ConfigParse {
                path: store.path().to_path_buf(),
                reason: format!("port {} out of range", port),
            })?,
            None => DEFAULT_PORT,
        };

        let telemetry_interval_secs = store.get_u64(KEY_TELEMETRY_INTERVAL_SECS)
            .unwrap_or(DEFAULT_TELEMETRY_INTERVAL_SECS);
        if telemetry_interval_secs == 0 {
            return Err(AgentError::ConfigParse {
                path: store.path().to_path_buf(),
                reason: "telemetry interval must be at least one second".into(),
            });
        }

        Ok(AgentConfig {
            config_path: store.path().to_path_buf(),
            hub_host_name,
            device_id,
            port,
            security,
            ca_cert_path: PathBuf::from(store.get_str(KEY_CA_CERT_PATH).unwrap_or(DEFAULT_CA_CERT_PATH)),
            telemetry_interval: Duration::from_secs(telemetry_interval_secs),
            message_timeout: Duration::from_millis(
                store.get_u64(KEY_MESSAGE_TIMEOUT_MS).unwrap_or(DEFAULT_MESSAGE_TIMEOUT_MS)),
            retry_timeout_limit: Duration::from_secs(
                store.get_u64(KEY_RETRY_TIMEOUT_LIMIT_SECS).unwrap_or(DEFAULT_RETRY_TIMEOUT_LIMIT_SECS)),
            syslog_facility: store.get_str(KEY_SYSLOG_FACILITY)
                .unwrap_or(DEFAULT_SYSLOG_FACILITY)
                .to_string(),
            log_file: store.get_str(KEY_LOG_FILE).map(PathBuf::from),
            verbose: store.get_bool(KEY_VERBOSE).unwrap_or(DEFAULT_VERBOSE),
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the command line interface
pub fn build_cli() -> Command {
    Command::new("pi_iot_agent")
        .version("1.0")
        .about("Raspberry Pi device agent for IoT Hub telemetry, methods and twin sync")
        .arg(Arg::new("config")
             .short('c')
             .long("config")
             .value_name("FILE")
             .help("Configuration file path (JSON format)")
             .default_value(DEFAULT_CONFIG_PATH))
        .arg(Arg::new("save-config")
             .long("save-config")
             .help("Merge command line into the configuration file and exit")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("hub")
             .long("hub")
             .value_name("HOST")
             .help("IoT Hub host name (e.g. myhub.azure-devices.net)"))
        .arg(Arg::new("device-id")
             .long("device-id")
             .value_name("ID")
             .help("Device identity registered in the hub"))
        .arg(Arg::new("port")
             .long("port")
             .value_name("PORT")
             .help("MQTT port"))
        .arg(Arg::new("sas")
             .long("sas")
             .help("Authenticate with a SAS token")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("x509")
             .long("x509")
             .help("Authenticate with an X.509 client certificate")
             .action(clap::ArgAction::SetTrue)
             .conflicts_with("sas"))
        .arg(Arg::new("sas-token")
             .long("sas-token")
             .value_name("TOKEN")
             .help("Pre-generated SAS token"))
        .arg(Arg::new("ca-cert")
             .long("ca-cert")
             .value_name("FILE")
             .help("CA bundle used to verify the hub (PEM)"))
        .arg(Arg::new("client-cert")
             .long("client-cert")
             .value_name("FILE")
             .help("Client certificate for X.509 mode (PEM)"))
        .arg(Arg::new("client-key")
             .long("client-key")
             .value_name("FILE")
             .help("Client private key for X.509 mode (PEM)"))
        .arg(Arg::new("telemetry-interval")
             .short('i')
             .long("telemetry-interval")
             .value_name("SECONDS")
             .help("Seconds between telemetry messages")
             .default_value(DEFAULT_TELEMETRY_INTERVAL_STR))
        .arg(Arg::new("syslog-facility")
             .long("syslog-facility")
             .value_name("FACILITY")
             .help("Syslog facility (daemon, user, local0-local7)")
             .default_value(DEFAULT_SYSLOG_FACILITY))
        .arg(Arg::new("log-file")
             .long("log-file")
             .value_name("FILE")
             .help("Log to a file instead of syslog"))
        .arg(Arg::new("verbose")
             .short('v')
             .long("verbose")
             .help("Echo log lines to the console")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("no-verbose")
             .long("no-verbose")
             .help("Disable console echo")
             .action(clap::ArgAction::SetTrue)
             .conflicts_with("verbose"))
}
