mod client;
mod flows;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "greenroom-studio")]
#[command(about = "Greenroom interview client: host or join a live session")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host an interview as the recruiter: create the session and call out
    Host {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        relay: String,

        /// Candidate identifier to bind the invite to
        #[arg(short, long)]
        candidate: Option<String>,

        /// Session title shown to participants
        #[arg(short, long)]
        title: Option<String>,

        /// Name announced to the other side
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Join an interview as the candidate with an invite token
    Join {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        relay: String,

        /// Session to join
        #[arg(short, long)]
        session: String,

        /// Invitation token from the recruiter
        #[arg(short = 'i', long)]
        invite: String,

        /// Name announced to the other side
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Run both sides in-process as a self-test, no relay needed
    Loopback,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Commands::Host {
            relay,
            candidate,
            title,
            name,
        } => flows::run_studio(relay, candidate, title, name).await,
        Commands::Join {
            relay,
            session,
            invite,
            name,
        } => flows::run_join(relay, session, invite, name).await,
        Commands::Loopback => flows::run_loopback().await,
    }
}
