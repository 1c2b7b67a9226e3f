mod config;

use config::Config;
use ddlsync::catalog;
use ddlsync::{MigrationRunner, RunOptions, RunReport};
use owo_colors::OwoColorize;
use std::process::ExitCode;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_ENGINE_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

const USAGE: &str = "\
Apply the classroom schema catalog to the database in DATABASE_URL.

Usage: ddlsync [OPTIONS]

Options:
  -V, --version  Show version information
  -h, --help     Show this help

Environment (also read from .env):
  DATABASE_URL                  connection string (required)
  DDLSYNC_LOCK_TIMEOUT_MS       lock wait bound, 0 disables [default: 30000]
  DDLSYNC_STATEMENT_TIMEOUT_MS  per-statement bound, 0 disables [default: 0]
  DDLSYNC_RUN_TIMEOUT_SECS      whole-run deadline, 0 disables [default: 0]
  RUST_LOG                      log filter [default: ddlsync=info]
";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {}
        Some("-V" | "--version") => {
            println!("ddlsync {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Some("-h" | "--help") => {
            print!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Some(other) => {
            eprintln!("unexpected argument: {}\n\n{}", other, USAGE);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    init_logging();

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(&config).await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(ddlsync::Error::Interrupted(reason)) => {
            eprintln!("{} {}; no changes were made", "interrupted:".yellow().bold(), reason);
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            eprintln!("{} {}", "migration failed:".red().bold(), error_chain(&e));
            eprintln!("no changes were made");
            ExitCode::from(EXIT_ENGINE_ERROR)
        }
    }
}

/// Logs go to stderr; stdout carries only the result line.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ddlsync=info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

async fn run(config: &Config) -> ddlsync::Result<RunReport> {
    catalog::validate(&catalog::catalog(), catalog::EXTERNAL_TABLES)?;

    info!(database = %config::mask_password(&config.database_url), "connecting");
    let mut client = connect(&config.database_url).await?;

    let options = RunOptions {
        lock_timeout: config.lock_timeout,
        statement_timeout: config.statement_timeout,
    };

    MigrationRunner::new(&mut client)
        .with_options(options)
        .run_until(interrupt(config.run_timeout))
        .await
}

/// Connect and drive the connection in the background. Failing to reach the
/// database means the schema cannot be inspected.
async fn connect(database_url: &str) -> ddlsync::Result<Client> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(ddlsync::Error::Inspection)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "connection error");
        }
    });
    Ok(client)
}

/// Resolves with a reason on Ctrl-C or when the run deadline passes.
async fn interrupt(deadline: Option<Duration>) -> String {
    let expired = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => "received Ctrl-C".to_string(),
        _ = expired => match deadline {
            Some(d) => format!("run deadline of {:?} exceeded", d),
            None => "run deadline exceeded".to_string(),
        },
    }
}

fn print_report(report: &RunReport) {
    let elapsed = format!("{}ms", report.elapsed.as_millis());
    if report.is_noop() {
        println!(
            "{} schema up to date ({} operations already present, {})",
            "ok".green().bold(),
            report.skipped.len(),
            elapsed.dimmed()
        );
    } else {
        println!(
            "{} applied {} operation(s), {} already present ({})",
            "ok".green().bold(),
            report.applied.len().bold(),
            report.skipped.len(),
            elapsed.dimmed()
        );
    }
    if !report.drift.is_empty() {
        println!(
            "{} {} column(s) differ from the catalog definition; see log",
            "warning:".yellow().bold(),
            report.drift.len()
        );
    }
}

/// Render an error with its source chain on one line.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        let text = s.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = s.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn test_error_chain() {
        assert_eq!(error_chain(&Outer(Inner)), "outer: inner");
    }

    #[tokio::test]
    async fn test_unreachable_database_is_an_inspection_error() {
        match connect("host=127.0.0.1 port=1 user=ddlsync connect_timeout=2").await {
            Err(ddlsync::Error::Inspection(_)) => {}
            Err(other) => panic!("expected Inspection, got {:?}", other),
            Ok(_) => panic!("connected to port 1"),
        }
    }

    #[tokio::test]
    async fn test_interrupt_deadline() {
        let reason = interrupt(Some(Duration::from_millis(10))).await;
        assert_eq!(reason, "run deadline of 10ms exceeded");
    }
}
