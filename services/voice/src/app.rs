//! Wiring of the session coordinator for the command line client.

use anyhow::{Context, anyhow};
use newme_realtime_core::{
    capture::Microphone,
    config::Config,
    coordinator::{CoordinatorConfig, CoordinatorDeps, SessionCoordinator},
    peer::WebRtcFactory,
    signaling::RelayBus,
    token::{HttpTokenIssuer, TokenIssuer, UnavailableTokenIssuer},
};
use newme_realtime_types::{
    ApplicationMessage, AudioDevice, ConnectionState, ParticipantId, SessionId,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The capture backend this binary was built with.
#[cfg(feature = "microphone")]
pub fn default_microphone() -> Arc<dyn Microphone> {
    Arc::new(newme_realtime_core::capture::CpalMicrophone::new())
}

#[cfg(not(feature = "microphone"))]
pub fn default_microphone() -> Arc<dyn Microphone> {
    Arc::new(newme_realtime_core::capture::VirtualMicrophone::new())
}

/// Builds the coordinator dependencies from the environment configuration.
pub fn build_deps(config: &Config, microphone: Arc<dyn Microphone>) -> anyhow::Result<CoordinatorDeps> {
    let signaling_url = config
        .signaling_url
        .as_deref()
        .ok_or_else(|| anyhow!("SIGNALING_URL must be set to join a session"))?;
    let peers = WebRtcFactory::new(config.ice_servers.clone())
        .context("Failed to initialise the WebRTC stack")?;
    let tokens: Arc<dyn TokenIssuer> = match config.token_endpoint.as_deref() {
        Some(endpoint) => Arc::new(
            HttpTokenIssuer::new(endpoint, config.token_api_key.clone())
                .context("Failed to create the token client")?,
        ),
        None => {
            warn!("TOKEN_ENDPOINT not set; the fallback transport is unavailable");
            Arc::new(UnavailableTokenIssuer)
        }
    };
    Ok(CoordinatorDeps {
        bus: Arc::new(RelayBus::new(signaling_url)),
        peers: Arc::new(peers),
        microphone,
        tokens,
    })
}

pub fn format_message(message: &ApplicationMessage) -> String {
    match message {
        ApplicationMessage::Text { text } => format!("< {}", text),
        ApplicationMessage::Partial { text } => format!("… {}", text),
    }
}

pub fn format_device(device: &AudioDevice) -> String {
    let marker = if device.is_default { " (default)" } else { "" };
    format!("{}\t{}{}", device.id, device.name, marker)
}

pub fn list_devices(microphone: &dyn Microphone) -> anyhow::Result<()> {
    let devices = microphone.devices().context("Failed to enumerate capture devices")?;
    if devices.is_empty() {
        println!("No capture devices found.");
    }
    for device in &devices {
        println!("{}", format_device(device));
    }
    Ok(())
}

pub struct ConnectArgs {
    pub session: String,
    pub participant: Option<String>,
    pub device: Option<String>,
    pub audio: bool,
}

/// Runs one session until stdin closes, `Ctrl+C`, or the session ends.
pub async fn run_connect(
    config: &Config,
    microphone: Arc<dyn Microphone>,
    args: ConnectArgs,
) -> anyhow::Result<()> {
    let participant = args
        .participant
        .map(ParticipantId::new)
        .unwrap_or_else(ParticipantId::random);
    let deps = build_deps(config, microphone)?;
    let coordinator = SessionCoordinator::new(
        deps,
        CoordinatorConfig::from_config(config, participant.clone()),
    );
    if args.device.is_some() {
        coordinator
            .select_device(args.device)
            .await
            .context("Failed to select capture device")?;
    }

    let (state_tx, mut states) = mpsc::unbounded_channel();
    let _states = coordinator.on_state(move |state| {
        let _ = state_tx.send(state);
    });
    let _messages = coordinator.on_message(|message| println!("{}", format_message(message)));
    let _errors = coordinator.on_error(|e| eprintln!("error: {}", e));
    let _levels = coordinator.on_audio_level(|level| debug!(level, "Input level"));

    info!(%participant, session = %args.session, "Connecting");
    coordinator
        .connect(SessionId::new(args.session))
        .await
        .context("Failed to start session")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut audio_started = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
            Some(state) = states.recv() => {
                println!("[{}] via {:?}", state, coordinator.active_transport());
                match state {
                    ConnectionState::Connected if args.audio && !audio_started => {
                        if let Err(e) = coordinator.start_audio().await {
                            eprintln!("error: {}", e);
                        } else {
                            audio_started = true;
                        }
                    }
                    ConnectionState::Disconnected | ConnectionState::Failed => break,
                    _ => {}
                }
            }
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => coordinator.send_message(&ApplicationMessage::text(line)).await,
                    None => break,
                }
            }
        }
    }

    coordinator.disconnect().await;
    Ok(())
}
