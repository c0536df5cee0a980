//! Command handlers for the gattlink CLI

use std::sync::Arc;
use std::time::Duration;

use gattlink_ble::{init_adapter, BtleplugConnector, DeviceScanner, OsManagedBonds};
use gattlink_core::{
    gatt_event_channel, DeviceAddress, LinkEvent, LinkEventReceiver, LinkHandle, LinkRuntime,
    LinkState, Uuid,
};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{parse_hex_payload, AppConfig};
use crate::error::{CliError, Result};

/// How long a requested disconnect may take before the link task is stopped
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// What to do once a connect command's link is ready
struct Session {
    send: Vec<String>,
    read: Vec<Uuid>,
    listen_secs: u64,
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Scan { seconds, all } => {
                Self::handle_scan_command(config, seconds, all).await
            }
            Commands::Connect {
                address,
                send,
                read,
                listen_secs,
            } => {
                let session = Session {
                    send,
                    read,
                    listen_secs,
                };
                Self::handle_connect_command(config, address, session).await
            }
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    async fn handle_scan_command(config: AppConfig, seconds: Option<u64>, all: bool) -> Result<()> {
        let adapter = init_adapter(config.adapter_index).await?;
        let filter = (!all && config.scan.filter_service).then_some(config.link.service_uuid);
        let duration = Duration::from_secs(seconds.unwrap_or(config.scan.seconds));

        let devices = DeviceScanner::new(adapter, filter).scan(duration).await?;
        if devices.is_empty() {
            println!("No devices found");
            return Ok(());
        }

        println!("{:<20} {:>6}  NAME", "ADDRESS", "RSSI");
        for device in &devices {
            let result = &device.result;
            let rssi = result
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<20} {:>6}  {}",
                result.address,
                rssi,
                result.name.as_deref().unwrap_or("(unknown)")
            );
        }
        println!("{} device(s)", devices.len());
        Ok(())
    }

    async fn handle_connect_command(
        config: AppConfig,
        address: String,
        session: Session,
    ) -> Result<()> {
        let address = DeviceAddress::new(&address)?;
        let mut payloads = Vec::new();
        if let Some(initial) = config.ready_payload()? {
            payloads.push(initial);
        }
        for raw in &session.send {
            payloads.push(parse_hex_payload(raw)?);
        }

        let adapter = init_adapter(config.adapter_index).await?;
        let (gatt_tx, gatt_rx) = gatt_event_channel();
        let connector = BtleplugConnector::new(adapter, gatt_tx, config.ble_config())?;
        connector.locate(&address).await?;

        let (link, mut events) = LinkRuntime::spawn(
            config.link.clone(),
            Arc::new(connector),
            Arc::new(OsManagedBonds),
            gatt_rx,
        )?;

        info!("Connecting to {}", address);
        link.connect(address).await?;

        let outcome = Self::run_session(
            &link,
            &mut events,
            payloads,
            session.read,
            session.listen_secs,
        )
        .await;
        Self::close_link(&link, &mut events).await;
        outcome
    }

    /// Drive the link until the listen window closes or the link drops
    async fn run_session(
        link: &LinkHandle,
        events: &mut LinkEventReceiver,
        mut payloads: Vec<Vec<u8>>,
        mut reads: Vec<Uuid>,
        listen_secs: u64,
    ) -> Result<()> {
        let mut listen_until: Option<Instant> = None;

        loop {
            let event = match listen_until {
                Some(deadline) => tokio::select! {
                    event = events.recv() => event,
                    _ = sleep_until(deadline) => {
                        info!("Listen window elapsed");
                        return Ok(());
                    }
                },
                None => events.recv().await,
            };
            let Some(event) = event else {
                return Err(CliError::Setup("link task stopped".to_string()));
            };

            match event {
                LinkEvent::Ready { mtu } => {
                    println!("Link ready (mtu {})", mtu);
                    for payload in payloads.drain(..) {
                        let chunks = link.send(payload.clone()).await?;
                        println!("Sent {} in {} chunk(s)", hex::encode_upper(&payload), chunks);
                    }
                    for characteristic in reads.drain(..) {
                        link.read(characteristic).await?;
                    }
                    listen_until = Some(Instant::now() + Duration::from_secs(listen_secs));
                }
                LinkEvent::PayloadReceived {
                    characteristic,
                    value,
                } => {
                    println!("{} <- {}", characteristic, hex::encode_upper(&value));
                }
                LinkEvent::ValueRead {
                    characteristic,
                    value,
                } => {
                    println!("{} = {}", characteristic, hex::encode_upper(&value));
                }
                LinkEvent::StateChanged { to, .. } => {
                    info!("Link {}", to);
                    if to == LinkState::Disconnected {
                        if listen_until.is_some() {
                            warn!("Device disconnected");
                            return Ok(());
                        }
                        return Err(CliError::Setup("disconnected before ready".to_string()));
                    }
                }
                LinkEvent::RetryExhausted { action, attempts } => {
                    warn!("{} abandoned after {} attempts", action, attempts);
                }
                LinkEvent::SetupStalled { error } => {
                    error!("Setup stalled: {}", error);
                    return Err(CliError::Setup(error.to_string()));
                }
                LinkEvent::TransportGone => {
                    return Err(CliError::Setup("transport gone".to_string()));
                }
            }
        }
    }

    async fn close_link(link: &LinkHandle, events: &mut LinkEventReceiver) {
        match link.state().await {
            Ok(LinkState::Disconnected) | Err(_) => {}
            Ok(_) => {
                if let Err(e) = link.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
                let wait = async {
                    while let Some(event) = events.recv().await {
                        if let LinkEvent::StateChanged {
                            to: LinkState::Disconnected,
                            ..
                        } = event
                        {
                            break;
                        }
                    }
                };
                if timeout(DISCONNECT_GRACE, wait).await.is_err() {
                    warn!("Device did not confirm disconnection");
                }
            }
        }
        if let Err(e) = link.shutdown().await {
            warn!("Failed to stop link task: {}", e);
        }
    }

    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }
}
