use obd_ble_client::{BluerPlatform, ConnectionConfig, ConnectionManager, ConnectionState};
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Engine RPM
const DEFAULT_QUERY: &str = "010C";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // obd-ble [ADDRESS] [COMMAND]
    let mut args = std::env::args().skip(1);
    let address = args.next();
    let query = args.next().unwrap_or_else(|| DEFAULT_QUERY.to_string());

    let config = ConnectionConfig::default();
    let (platform, events) = BluerPlatform::new().await?;
    let manager = ConnectionManager::new(config.clone(), platform, events);

    manager.initialize().await?;
    if let ConnectionState::Error(message) = manager.current_state() {
        error!("Bluetooth unavailable: {}", message);
        return Ok(());
    }

    let address = match address {
        Some(address) => address,
        None => {
            manager.start_scanning().await?;
            let mut devices = manager.devices();
            let found = tokio::time::timeout(
                config.scan.scan_duration + Duration::from_secs(1),
                devices.wait_for(|d| !d.is_empty()),
            )
            .await
            .is_ok_and(|r| r.is_ok());
            manager.stop_scanning().await;

            if !found {
                warn!("No OBD-II adapter found");
                manager.cleanup().await;
                return Ok(());
            }

            let devices = manager.discovered_devices();
            for device in &devices {
                info!(
                    "Found {} {} ({} dBm)",
                    device.address,
                    device.name.as_deref().unwrap_or("?"),
                    device.rssi
                );
            }
            match devices.into_iter().next() {
                Some(device) => device.address,
                None => {
                    manager.cleanup().await;
                    return Ok(());
                }
            }
        }
    };

    if manager.connect_with_retry(&address).await? {
        match manager.send_command(&query).await? {
            Some(response) => info!("{} -> {}", query, response),
            None => warn!("{} got no response", query),
        }
    } else {
        error!("Could not connect to {}", address);
    }

    manager.cleanup().await;
    Ok(())
}
