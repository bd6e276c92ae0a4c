use std::path::PathBuf;
use std::sync::OnceLock;
use syslog::{BasicLogger, Facility, Formatter3164};
use log::{LevelFilter, debug, info, warn, error};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// Name the agent logs under.
pub const LOGGER_NAME: &str = "iotcentral";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Logging options taken from the agent configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub syslog_facility: String,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

impl From<&AgentConfig> for LogConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            syslog_facility: config.syslog_facility.clone(),
            log_file: config.log_file.clone(),
            verbose: config.verbose,
        }
    }
}

pub fn parse_facility(name: &str) -> Facility {
    match name {
        "daemon" => Facility::LOG_DAEMON,
        "user" => Facility::LOG_USER,
        "local0" => Facility::LOG_LOCAL0,
        "local1" => Facility::LOG_LOCAL1,
        "local2" => Facility::LOG_LOCAL2,
        "local3" => Facility::LOG_LOCAL3,
        "local4" => Facility::LOG_LOCAL4,
        "local5" => Facility::LOG_LOCAL5,
        "local6" => Facility::LOG_LOCAL6,
        "local7" => Facility::LOG_LOCAL7,
        _ => Facility::LOG_USER,
    }
}

/// Install the process-wide `log` backend. Only the first call has an effect.
pub fn init(config: &LogConfig) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    if let Some(ref path) = config.log_file {
        simple_logging::log_to_file(path, LevelFilter::Debug)
            .map_err(|e| AgentError::Logger(format!("cannot log to {} - {}", path.display(), e)))?;
    } else {
        let formatter = Formatter3164 {
            facility: parse_facility(&config.syslog_facility),
            hostname: None,
            process: LOGGER_NAME.into(),
            pid: std::process::id(),
        };

        let logger = syslog::unix(formatter)
            .map_err(|e| AgentError::Logger(format!("impossible to connect to syslog: {:?}", e)))?;
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|()| log::set_max_level(LevelFilter::Debug))
            .map_err(|e| AgentError::Logger(e.to_string()))?;
    }

    let _ = INSTALLED.set(());
    debug!("SysLogHandler setup");
    Ok(())
}

/// Shared logging handle; echoes to the console when verbose.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    verbose: bool,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn log_debug(&self, message: &str) {
        if self.verbose {
            println!("DEBUG: {}", message);
        }

        debug!("{}", message);
    }

    pub fn log_info(&self, message: &str) {
        if self.verbose {
            println!("INFO: {}", message);
        }

        info!("{}", message);
    }

    pub fn log_warning(&self, message: &str) {
        if self.verbose {
            println!("WARNING: {}", message);
        }

        warn!("{}", message);
    }

    pub fn log_error(&self, message: &str) {
        eprintln!("ERROR: {}", message);

        error!("{}", message);
    }
}
