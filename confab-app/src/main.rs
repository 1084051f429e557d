//! Confab headless host.
//!
//! Wires the call engine to a terminal: assistant text and transcripts
//! stream to stdout, status changes go through tracing, Ctrl+C hangs up.
//! Any richer frontend subscribes to the same broadcast channels.

mod settings;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use confab_core::{ApiConfig, CallConfig, CallEngine, CallPayload, ConfabError};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use settings::{default_settings_path, load_settings, save_settings};

fn engine_config(settings: &settings::ClientSettings) -> CallConfig {
    let mut config = CallConfig::default();
    config.gate.speaking_threshold = settings.speaking_threshold;
    config.gate.start_frames = settings.speech_start_frames;
    config.gate.end_frames = settings.speech_end_frames;
    config.gate.silence_timeout = Duration::from_millis(settings.silence_timeout_ms);
    config.recorder.max_duration = Duration::from_secs(settings.max_recording_secs);
    config.turn_history = settings.turn_history;
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=info".parse().unwrap()),
        )
        .init();

    info!("Confab starting");

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    // First run: write the defaults so there is a file to edit.
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &settings) {
            tracing::warn!(error = %e, path = %settings_path.display(), "could not write settings");
        }
    }
    info!(server = %settings.server_url, "using settings from {}", settings_path.display());

    let api = ApiConfig {
        base_url: settings.server_url.clone(),
        ..ApiConfig::default()
    };
    let engine = Arc::new(
        CallEngine::new(engine_config(&settings), api).context("failed to build call engine")?,
    );

    let mut events = engine.subscribe_events();
    let mut status = engine.subscribe_status();

    engine
        .start_with_device(settings.preferred_input_device.clone())
        .await
        .context("failed to start the call")?;

    println!("📞 Call started — speak, or press Ctrl+C to hang up.");

    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => match event.payload {
                        CallPayload::TurnStarted => {
                            println!("\n[you] (voice sent)");
                            print!("[ai] ");
                            let _ = std::io::stdout().flush();
                        }
                        CallPayload::Text { content } | CallPayload::Transcript { content } => {
                            print!("{content}");
                            let _ = std::io::stdout().flush();
                        }
                        CallPayload::TurnCompleted { .. } => println!(),
                        CallPayload::TurnInterrupted => println!(" [interrupted]"),
                        CallPayload::ServerError { message } => {
                            eprintln!("\n⚠ server error: {message}");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event printer lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                st = status.recv() => match st {
                    Ok(event) => {
                        if let Some(detail) = event.detail {
                            println!("\n({detail})");
                        }
                        info!(status = ?event.status, "call status");
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    println!("\nHanging up…");
    match engine.stop() {
        Ok(()) | Err(ConfabError::NotRunning) => {}
        Err(e) => tracing::warn!(error = %e, "stop failed"),
    }
    printer.abort();

    let snapshot = engine.diagnostics_snapshot();
    info!(
        turns_started = snapshot.turns_started,
        turns_completed = snapshot.turns_completed,
        turns_interrupted = snapshot.turns_interrupted,
        "call ended"
    );
    Ok(())
}
