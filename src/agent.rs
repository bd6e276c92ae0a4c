use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use serde_json::{Value, json};

use crate::config::{AgentConfig, ConfigStore, KEY_TELEMETRY_INTERVAL_SECS};
use crate::device::DeviceState;
use crate::dispatch::HandlerStatus;
use crate::hub::{HubClient, HubTransport};
use crate::logger::Logger;
use crate::twin::property_value;

pub const CPU_TEMPERATURE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// The device agent: hub shim plus the handlers and telemetry a Raspberry Pi
/// ships with.
pub struct Agent {
    device_id: String,
    hub: Arc<HubClient>,
    store: Arc<Mutex<ConfigStore>>,
    telemetry_secs: Arc<AtomicU64>,
    temperature_path: PathBuf,
    logger: Logger,
}

impl Agent {
    pub fn new(config: &AgentConfig, store: ConfigStore, transport: Arc<dyn HubTransport>, logger: Logger) -> Self {
        let hub = Arc::new(HubClient::new(transport, Arc::new(DeviceState::new()), logger.clone()));
        let agent = Self {
            device_id: config.device_id.clone(),
            hub,
            store: Arc::new(Mutex::new(store)),
            telemetry_secs: Arc::new(AtomicU64::new(config.telemetry_interval.as_secs().max(1))),
            temperature_path: PathBuf::from(CPU_TEMPERATURE_PATH),
            logger,
        };
        agent.register_builtin_handlers();
        agent
    }

    /// Read the CPU temperature from somewhere else (tests, non-Pi hosts).
    pub fn with_temperature_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temperature_path = path.into();
        self
    }

    pub fn hub(&self) -> &Arc<HubClient> {
        &self.hub
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_secs.load(Ordering::SeqCst))
    }

    fn register_builtin_handlers(&self) {
        self.hub.register_method("ping", |_| HandlerStatus::new(200, "pong"));

        let logger = self.logger.clone();
        self.hub.register_method("reboot", move |payload| reboot(payload, &logger));

        let telemetry_secs = self.telemetry_secs.clone();
        let store = self.store.clone();
        let logger = self.logger.clone();
        self.hub.register_desired_property(KEY_TELEMETRY_INTERVAL_SECS, move |property| {
            set_telemetry_interval(property, &telemetry_secs, &store, &logger)
        });
    }

    pub fn telemetry_payload(&self) -> String {
        let temperature = read_cpu_temperature(&self.temperature_path);
        json!({
            "deviceId": self.device_id,
            "cpuTemperature": temperature,
            "messageCount": self.hub.state().sent_count(),
        })
        .to_string()
    }

    pub fn send_telemetry(&self) {
        let payload = self.telemetry_payload();
        match self.hub.send_message(&payload) {
            Ok(()) => self.logger.log_debug(&format!("Sent telemetry {}", payload)),
            Err(e) => self.logger.log_warning(&format!("Telemetry not sent: {}", e)),
        }
    }

    /// Send telemetry forever; interval changes apply from the next message.
    pub async fn run_telemetry(&self) {
        loop {
            tokio::time::sleep(self.telemetry_interval()).await;
            self.send_telemetry();
        }
    }
}

fn reboot(payload: &Value, logger: &Logger) -> HandlerStatus {
    if payload["dryRun"].as_bool().unwrap_or(false) {
        logger.log_info("Reboot requested (dry run)");
        return HandlerStatus::new(200, "reboot skipped (dry run)");
    }

    logger.log_warning("Reboot requested by the hub");
    match tokio::process::Command::new("shutdown").args(["-r", "now"]).spawn() {
        Ok(mut child) => {
            let logger = logger.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if !status.success() => logger.log_error(&format!("Reboot command failed: {}", status)),
                    Err(e) => logger.log_error(&format!("Reboot command lost: {}", e)),
                    Ok(_) => {}
                }
            });
            HandlerStatus::new(200, "rebooting")
        }
        Err(e) => {
            logger.log_error(&format!("Cannot start reboot: {}", e));
            HandlerStatus::new(500, &format!("reboot failed: {}", e))
        }
    }
}

fn set_telemetry_interval(
    property: &Value,
    telemetry_secs: &AtomicU64,
    store: &Arc<Mutex<ConfigStore>>,
    logger: &Logger,
) -> HandlerStatus {
    let secs = match property_value(property).as_u64() {
        Some(secs) if secs > 0 => secs,
        _ => return HandlerStatus::new(400, "telemetry interval must be a positive integer"),
    };

    telemetry_secs.store(secs, Ordering::SeqCst);
    logger.log_info(&format!("Telemetry interval set to {}s", secs));

    store.lock().unwrap_or_else(|e| e.into_inner()).set(KEY_TELEMETRY_INTERVAL_SECS, secs);
    persist(store.clone(), logger.clone());
    HandlerStatus::completed()
}

/// Write the config document on the blocking pool, or inline when no
/// runtime is around.
fn persist(store: Arc<Mutex<ConfigStore>>, logger: Logger) {
    let save = move || {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = store.save() {
            logger.log_error(&format!("Cannot persist config: {}", e));
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(save);
        }
        Err(_) => save(),
    }
}

/// CPU temperature in °C from a thermal zone file holding millidegrees.
pub fn read_cpu_temperature(path: &Path) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let millis: f64 = raw.trim().parse().ok()?;
    Some(millis / 1000.0)
}
