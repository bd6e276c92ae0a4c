// src/lib.rs
pub mod error;
pub use error::{AgentError, Result};

pub mod config;
pub use config::{AgentConfig, ConfigBuilder, ConfigStore, Security};
pub use config::DEFAULT_CONFIG_PATH;

pub mod logger;
pub use logger::{LogConfig, Logger};

pub mod device;
pub use device::{DeviceSnapshot, DeviceState};

pub mod dispatch;
pub use dispatch::{DispatchTable, HandlerName, HandlerStatus};

pub mod twin;
pub use twin::{TwinAction, TwinUpdateState};

pub mod hub;
pub use hub::{HubClient, HubEvents, HubTransport, MethodResponse, OutboundMessage};

pub mod mqtt;
pub use mqtt::{MqttEventLoop, MqttTransport};

pub mod agent;
pub use agent::Agent;
