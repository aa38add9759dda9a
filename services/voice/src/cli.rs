use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "newme-voice")]
#[command(version)]
#[command(about = "Joins a realtime voice/chat session", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Joins a session; stdin lines are sent as text messages.
    Connect {
        #[arg(long)]
        session: String,
        /// Defaults to a random id.
        #[arg(long)]
        participant: Option<String>,
        #[arg(long)]
        device: Option<String>,
        /// Text only, no microphone.
        #[arg(long, default_value_t = false)]
        no_audio: bool,
    },
    /// Lists capture devices.
    Devices,
}
