mod core;
mod devices;
mod domain;
mod infrastructure;
mod services;
#[cfg(test)]
mod testing;

use crate::core::factory::DongleFactory;
use crate::core::fleet::Cybele;
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluez::DbusBluetoothBus;
use crate::infrastructure::logging::init_logger;
use crate::infrastructure::mqtt::MqttTransport;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Bridge between BLE peripherals managed by BlueZ and an MQTT broker
#[derive(Debug, Parser)]
#[command(name = "cybele", version, about)]
struct Cli {
    /// Config file (default: <config dir>/cybele/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_service = SettingsService::load(cli.config.as_deref())?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.logging)?;
    info!(
        "Starting Cybele with config {}",
        settings_service.path().display()
    );

    let bus = DbusBluetoothBus::system()
        .await
        .context("Failed to connect to the system bus")?;
    let (transport, mut inbound) = MqttTransport::connect(&settings.mqtt);

    let factory = DongleFactory::new(Arc::new(bus), Arc::new(transport), &settings.mqtt);
    let cybele = Cybele::new(factory, settings.recovery.clone());

    if let Err(e) = cybele.initialize(&settings.dongles).await {
        error!("Startup failed: {}", e);
        cybele.destroy().await;
        return Err(e).context("Failed to initialize dongles");
    }
    info!("Cybele is running");

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => cybele.route_message(&message).await,
                None => {
                    error!("MQTT event loop stopped");
                    break;
                }
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    cybele.destroy().await;
    Ok(())
}
