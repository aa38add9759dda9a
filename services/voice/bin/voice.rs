//! Command line client for realtime voice/chat sessions.

use anyhow::Context;
use clap::Parser;
use newme_realtime_core::config::Config;
use newme_voice::app::{self, ConnectArgs};
use newme_voice::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let microphone = app::default_microphone();
    match cli.command {
        Command::Devices => app::list_devices(microphone.as_ref()),
        Command::Connect {
            session,
            participant,
            device,
            no_audio,
        } => {
            app::run_connect(
                &config,
                microphone,
                ConnectArgs {
                    session,
                    participant,
                    device,
                    audio: !no_audio,
                },
            )
            .await
        }
    }
}
