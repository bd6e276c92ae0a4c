use std::sync::Arc;
use std::time::Duration;

use pi_iot_agent::{Agent, ConfigBuilder, HubEvents, LogConfig, Logger, MqttTransport};
use pi_iot_agent::config::build_cli;
use pi_iot_agent::logger;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let matches = build_cli().get_matches();

    // --config always has a value thanks to its default
    let config_path = matches.get_one::<String>("config")
        .ok_or("no configuration file given")?;
    let builder = ConfigBuilder::new()
        .load_config_file(config_path)
        .map_err(|e| format!("Failed to load config file '{}': {}", config_path, e))?
        .merge_command_line(&matches);

    if matches.get_flag("save-config") {
        builder.store().save()?;
        println!("Saved configuration to: {}", config_path);
        return Ok(());
    }

    let config = builder.build()?;

    logger::init(&LogConfig::from(&config))?;
    let logger = Logger::new(config.verbose);
    builder.store().dump();

    let (transport, event_loop) = match MqttTransport::connect(&config, logger.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            logger.log_error(&format!("Unexpected error {} from IoTHub", e));
            return Err(e.into());
        }
    };

    let agent = Agent::new(&config, builder.into_store(), Arc::new(transport.clone()), logger.clone());
    let events: Arc<dyn HubEvents> = agent.hub().clone();

    logger.log_info(&format!(
        "Agent for {} started, telemetry every {}s",
        config.device_id,
        agent.telemetry_interval().as_secs()
    ));

    // the event loop owns the request queue, so it must outlive the disconnect
    let mut connection = tokio::spawn(event_loop.run(events));

    tokio::select! {
        joined = &mut connection => {
            if let Err(e) = joined? {
                logger.log_error(&format!("Hub connection lost: {}", e));
                return Err(e.into());
            }
        }

        _ = agent.run_telemetry() => {}

        _ = tokio::signal::ctrl_c() => {
            logger.log_info("Shutting down");
            if let Err(e) = transport.disconnect().await {
                logger.log_warning(&format!("Disconnect failed: {}", e));
            }
            match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut connection).await {
                Ok(Ok(Err(e))) => logger.log_warning(&format!("Hub connection closed with: {}", e)),
                Ok(Err(e)) => logger.log_warning(&format!("Hub connection task failed: {}", e)),
                Err(_) => {
                    logger.log_warning("Hub connection did not close in time");
                    connection.abort();
                }
                Ok(Ok(Ok(()))) => {}
            }
        }
    }

    Ok(())
}
