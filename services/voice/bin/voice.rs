//! Main Entrypoint for the OCTN Voice Client
//!
//! This binary is responsible for:
//! 1. Parsing the command line and loading configuration from the environment.
//! 2. Resolving the agent profile and collecting recording consent.
//! 3. Starting a session on the default audio devices.
//! 4. Feeding terminal commands and Ctrl+C into the session until it ends.

use anyhow::Context;
use clap::Parser;
use octn_core::{
    Control,
    agent::{AgentKind, AgentRegistry},
    tools::{LoggingMailer, ToolResponder},
};
use octn_voice::{
    commands,
    config::Config,
    consent::{Consent, request_consent},
    device::CpalDevices,
    session::{GeminiConnector, Session, SessionSettings},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Talk to an OCTN voice agent from the terminal")]
struct Cli {
    /// Agent to talk to.
    #[arg(long, default_value_t = AgentKind::Interviewer)]
    agent: AgentKind,

    /// Consent to the session being recorded without being asked.
    #[arg(long)]
    accept_recording: bool,

    /// Print the available agents and exit.
    #[arg(long)]
    list_agents: bool,
}

/// Listens for the `Ctrl+C` signal and asks the session to end.
async fn shutdown_signal(controls: mpsc::Sender<Control>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received shutdown signal. Ending session...");
        let _ = controls.send(Control::End).await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.list_agents {
        for profile in AgentRegistry::builtin().iter() {
            println!(
                "{:<12} {} - {}: {}",
                profile.kind.id().to_lowercase(),
                profile.name,
                profile.role,
                profile.description
            );
        }
        return Ok(());
    }

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},tungstenite=warn,tokio_tungstenite=warn",
        config.log_level
    ));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(?config, "Configuration loaded.");

    // --- 3. Resolve the Agent ---
    let mut registry = AgentRegistry::builtin();
    if let Some(prompts_path) = &config.prompts_path {
        registry = registry.with_overrides(prompts_path).with_context(|| {
            format!("Failed to load prompts from {}", prompts_path.display())
        })?;
    }
    let profile = registry
        .get(cli.agent)
        .with_context(|| format!("No profile registered for agent {}", cli.agent))?;

    // --- 4. Collect Consent ---
    let consent = if cli.accept_recording {
        Consent::pre_accepted()
    } else {
        let answer = request_consent(
            std::io::stdin().lock(),
            std::io::stdout(),
            &config.recruiter_email,
        )?;
        match answer {
            Some(consent) => consent,
            None => {
                println!("Recording consent is required to talk to an agent.");
                return Ok(());
            }
        }
    };

    // --- 5. Start the Session ---
    let responder = ToolResponder::new(
        Arc::new(LoggingMailer::new(config.recruiter_email.clone())),
        config.recruiter_email.clone(),
    );
    let mut session = Session::new(
        profile,
        SessionSettings::from_config(&config),
        Box::new(CpalDevices::new()),
        Box::new(GeminiConnector::from_config(&config)),
        responder,
    );
    println!("{}, {}, is joining the call...", profile.name, profile.role);
    if let Err(e) = session.start(consent).await {
        eprintln!("{}", session.state().status_message);
        return Err(e).context("Failed to start session");
    }
    println!("{}", session.state().status_message);
    println!("Type 'm' + Enter to toggle mute, 'q' + Enter to end the call.");

    // --- 6. Run Until the Call Ends ---
    let (controls_tx, controls_rx) = mpsc::channel(8);
    commands::spawn_reader(std::io::BufReader::new(std::io::stdin()), controls_tx.clone())
        .context("Failed to start the command reader")?;
    tokio::spawn(shutdown_signal(controls_tx));
    session.run(controls_rx).await;

    info!(
        state = %serde_json::to_string(session.state())?,
        "Session has finished."
    );
    println!("{}", session.state().status_message);
    Ok(())
}
