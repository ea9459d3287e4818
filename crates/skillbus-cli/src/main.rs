//! CLI entry point for skillbus.
//!
//! This binary provides the `skillbus` command: an interactive REPL over the
//! dispatch pipeline, a one-shot `say`, and a `status` report.

mod cli;
mod repl;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use skillbus_intent::IntentService;
use skillbus_kernel::{Configuration, MessageBus};

use crate::cli::{Cli, Commands};

/// Firehose capacity of the process bus.
const BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Loaded before tracing so `.env` can set RUST_LOG.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(match cli.command {
        Commands::Run => "info",
        _ => "warn",
    });
    if let Some(problem) = dotenv_problem(&dotenv) {
        warn!(error = %problem, "ignoring .env file");
    }

    match &cli.command {
        Commands::Run => cmd_run(&cli).await,
        Commands::Say { words } => cmd_say(&cli, &words.join(" ")).await,
        Commands::Status => cmd_status(&cli),
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_run(cli: &Cli) -> Result<()> {
    let service = build_service(cli)?;
    let tasks = service.start();
    info!(
        skills = service.skills().len(),
        lang = %service.settings().lang,
        "pipeline started"
    );

    repl::run_repl(&service, &cli.session).await?;

    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn cmd_say(cli: &Cli, utterance: &str) -> Result<()> {
    let service = build_service(cli)?;
    let tasks = service.start();

    for reply in repl::dispatch(&service, &cli.session, utterance).await? {
        println!("{reply}");
    }

    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn cmd_status(cli: &Cli) -> Result<()> {
    let service = build_service(cli)?;

    let skills: Vec<_> = service
        .skills()
        .snapshot()
        .iter()
        .map(|skill| json!({ "id": skill.id(), "capabilities": skill.capabilities() }))
        .collect();
    let fallbacks: Vec<_> = service
        .fallback()
        .entries()
        .into_iter()
        .map(|entry| {
            json!({
                "skill_id": entry.skill_id,
                "priority": entry.priority,
                "active": entry.active,
            })
        })
        .collect();

    let report = json!({
        "settings": service.settings(),
        "skills": skills,
        "fallbacks": fallbacks,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load the layered configuration and build the service around it.
fn build_service(cli: &Cli) -> Result<IntentService> {
    let config = Configuration::from_files(cli.config.as_slice()).context("failed to load configuration")?;
    if let Some(lang) = &cli.lang {
        config.set("lang", json!(lang.to_lowercase()));
    }

    let service = IntentService::new(MessageBus::new(BUS_CAPACITY), &config);
    if !cli.no_skills {
        let loaded = skillbus_skills::register_all(&service, skillbus_skills::default_skills())
            .context("failed to load probe skills")?;
        info!(count = loaded, "probe skills loaded");
    }
    Ok(service)
}

/// Why `.env` was not applied, if it exists but could not be loaded.
fn dotenv_problem(result: &dotenvy::Result<PathBuf>) -> Option<String> {
    match result {
        Ok(path) => {
            debug!(path = %path.display(), ".env loaded");
            None
        }
        Err(e) if e.not_found() => None,
        Err(e) => Some(e.to_string()),
    }
}

/// Initialize the tracing subscriber with the given default level.
///
/// Respects `RUST_LOG` if set; otherwise uses `default_level`.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_file_is_not_a_problem() {
        let dir = tempfile::tempdir().unwrap();
        let result = dotenvy::from_path(dir.path().join(".env")).map(|()| dir.path().join(".env"));
        assert_eq!(dotenv_problem(&result), None);
    }

    #[test]
    fn malformed_env_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "SKILLBUS-NOT-A-KEY=1\n").unwrap();

        let result = dotenvy::from_path(&path).map(|()| path.clone());
        assert!(dotenv_problem(&result).is_some());
    }
}
