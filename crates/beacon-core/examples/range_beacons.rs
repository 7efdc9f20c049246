//! Example: Ranging iBeacons with the btleplug backend
//!
//! This example starts the engine over the local Bluetooth adapter, subscribes
//! to every beacon in range through the command dispatcher, and prints each
//! ranging window for 30 seconds.
//!
//! Run with: `cargo run --example range_beacons`
//!
//! Set `RUST_LOG=beacon_core=debug` to see engine logs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{
    Backend, BeaconEngine, BtleRadio, BtleScanner, CloudCredentials, CommandDispatcher,
    ConnectTarget, DeviceConnector, DeviceLink, EnablePrompt, EngineConfig, Error, Result,
    Status, responder_channel,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Asks the user on the terminal instead of showing a dialog.
struct TerminalPrompt;

#[async_trait]
impl EnablePrompt for TerminalPrompt {
    async fn request_enable(&self) -> Result<()> {
        println!("Bluetooth is off. Turn it on and run the example again.");
        Ok(())
    }
}

/// This example only observes; management connections are refused.
struct NoConnector;

#[async_trait]
impl DeviceConnector for NoConnector {
    async fn open(
        &self,
        target: &ConnectTarget,
        _credentials: Option<&CloudCredentials>,
    ) -> Result<Arc<dyn DeviceLink>> {
        Err(Error::NotFound(format!("{} is not connectable here", target.mac())))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::default().ranging_period_ms(2000);
    let backend = Backend {
        scanner: Arc::new(BtleScanner::new(&config)),
        radio: Arc::new(BtleRadio::new().await?),
        prompt: Arc::new(TerminalPrompt),
        connector: Arc::new(NoConnector),
    };
    let engine = BeaconEngine::start(config, backend)?;
    let dispatcher = CommandDispatcher::new(Arc::clone(&engine));

    if !engine.bluetooth_state().await? {
        return Ok(());
    }

    println!("Ranging beacons for 30 seconds...");
    println!();

    let (responder, mut results) = responder_channel();
    dispatcher
        .dispatch(
            "beacons_startRangingBeaconsInRegion",
            &[json!({"identifier": "everything"})],
            responder,
        )
        .await;

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            result = results.recv() => {
                let Some(result) = result else { break };
                if result.status != Status::Ok {
                    println!("Ranging stopped: {:?}", result.payload);
                    break;
                }
                let Some(payload) = result.payload else { continue };
                let beacons = payload["beacons"].as_array().cloned().unwrap_or_default();
                println!("{} beacon(s) in range", beacons.len());
                for beacon in &beacons {
                    println!(
                        "  {} major={} minor={} rssi={} dBm distance={:.2} m",
                        beacon["proximityUUID"].as_str().unwrap_or("?"),
                        beacon["major"],
                        beacon["minor"],
                        beacon["rssi"],
                        beacon["distance"].as_f64().unwrap_or(-1.0),
                    );
                }
            }
        }
    }

    engine.teardown().await;
    Ok(())
}
