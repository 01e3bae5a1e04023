use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "greenroom-relay")]
#[command(about = "Greenroom signaling relay and operator tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that a running relay answers on its health endpoint
    Probe {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,
    },
    /// Create a session on a running relay and print the invite
    Invite {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Candidate identifier to bind the invite to
        #[arg(short, long)]
        candidate: Option<String>,

        /// Session title shown to participants
        #[arg(short, long)]
        title: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    session_id: String,
    candidate_id: String,
    invite_token: String,
    invite_url: String,
    recruiter_ws_url: String,
}

fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?)
}

pub async fn run_probe(url: String) -> Result<()> {
    debug!("probing {}", url);
    let body: HealthBody = client()?
        .get(format!("{}/health", url.trim_end_matches('/')))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("relay at {} reports: {}", url, body.status);
    Ok(())
}

pub async fn run_invite(
    url: String,
    candidate: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let created: CreatedSession = client()?
        .post(format!("{}/sessions", url.trim_end_matches('/')))
        .json(&serde_json::json!({ "candidate_id": candidate, "title": title }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("session:      {}", created.session_id);
    println!("candidate:    {}", created.candidate_id);
    println!("invite token: {}", created.invite_token);
    println!("invite url:   {}", created.invite_url);
    println!("recruiter ws: {}", created.recruiter_ws_url);
    Ok(())
}
