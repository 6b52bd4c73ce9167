//! `dsopt`: store credentials and follow dataset optimization runs.

mod progress;

use std::io::{BufRead as _, Write as _};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use dsopt_client::credentials::{API_HOST_VAR, API_KEY_VAR, CredentialLocation, upsert_credential};
use dsopt_client::observability::init_observability;
use dsopt_client::table::{IndexedFrame, PolarsTables};
use dsopt_client::{ApiClient, ClientConfig, DatasetOptimizationResults, RunMonitor};
use tracing::debug;

use crate::progress::BarProgress;

#[derive(Parser, Debug)]
#[command(name = "dsopt", version, about = "Dataset optimization client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store the API key in the local credential file
    SetApiKey {
        /// API key; prompted for when omitted
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Change the API server address
    ChangeRemote {
        /// Server address, e.g. `api.example.com`; prompted for when omitted
        #[arg(long)]
        api_host: Option<String>,
    },
    /// Store both the API key and the server address
    Setup {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        api_host: Option<String>,
    },
    /// Follow a run to completion and download its results
    CheckRun {
        run_id: String,
        /// Return as soon as the run waits for manual approval
        #[arg(long)]
        stop_on_manual_approval: bool,
    },
    /// List optimization runs
    ListRuns {
        #[arg(long)]
        organization_id: Option<i64>,
    },
    /// Cancel a run
    CancelRun { run_id: String },
    /// Archive a run
    ArchiveRun { run_id: String },
}

fn main() -> anyhow::Result<()> {
    init_observability();
    let args = Args::parse();
    match args.command {
        Command::SetApiKey { api_key } => {
            let api_key = value_or_prompt(api_key, "Please enter the API key value")?;
            let location = store(API_KEY_VAR, &api_key)?;
            println!("API key saved to {}. {}", location.path().display(), SECRET_NOTICE);
        }
        Command::ChangeRemote { api_host } => {
            let api_host = value_or_prompt(api_host, "Please enter the API server address")?;
            let api_host = normalize_host(&api_host)?;
            let location = store(API_HOST_VAR, &api_host)?;
            println!("API host {api_host} saved to {}", location.path().display());
        }
        Command::Setup { api_key, api_host } => {
            let api_key = value_or_prompt(api_key, "Please enter the API key value")?;
            let api_host = value_or_prompt(api_host, "Please enter the API server address")?;
            let api_host = normalize_host(&api_host)?;
            let location = store(API_HOST_VAR, &api_host)?;
            store(API_KEY_VAR, &api_key)?;
            println!(
                "API host and API key saved to {}. {}",
                location.path().display(),
                SECRET_NOTICE
            );
        }
        Command::CheckRun {
            run_id,
            stop_on_manual_approval,
        } => {
            let monitor = RunMonitor::with_tables(ClientConfig::from_env()?, PolarsTables)?;
            let outcome = monitor.check_run(
                &run_id,
                stop_on_manual_approval,
                BarProgress::new(&run_id),
            )?;
            match outcome {
                Some(results) => print_results(&results),
                None => println!("Run {run_id} is awaiting manual approval"),
            }
        }
        Command::ListRuns { organization_id } => {
            let runs = ApiClient::new(ClientConfig::from_env()?)?.list_runs(organization_id)?;
            for run in runs {
                println!(
                    "{}\t{}\t{}\t{}",
                    run.run_id,
                    run.name,
                    run.status,
                    run.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::CancelRun { run_id } => {
            ApiClient::new(ClientConfig::from_env()?)?.cancel_run(&run_id)?;
            println!("Run {run_id} cancelled");
        }
        Command::ArchiveRun { run_id } => {
            ApiClient::new(ClientConfig::from_env()?)?.archive_run(&run_id)?;
            println!("Run {run_id} archived");
        }
    }
    Ok(())
}

const SECRET_NOTICE: &str = "Do not share this file since it contains your secret API key.";

fn store(name: &str, value: &str) -> anyhow::Result<CredentialLocation> {
    let location = CredentialLocation::resolve()?;
    upsert_credential(location.path(), name, value)
        .with_context(|| format!("failed to write {}", location.path().display()))?;
    debug!(event = "credentials.saved", domain = "cli", key = name);
    Ok(location)
}

fn value_or_prompt(value: Option<String>, label: &str) -> anyhow::Result<String> {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        return Ok(value.trim().to_string());
    }
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        bail!("no value entered");
    }
    Ok(line.to_string())
}

/// Adds `https://` when the scheme is missing and drops any path, query or
/// fragment, keeping the port.
fn normalize_host(raw: &str) -> anyhow::Result<String> {
    let raw = raw.trim();
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        eprintln!("API host must start with 'http://' or 'https://'. Added 'https://'.");
        format!("https://{raw}")
    };
    let url = url::Url::parse(&with_scheme).with_context(|| format!("invalid API host {raw:?}"))?;
    let Some(host) = url.host_str() else {
        bail!("API host {raw:?} has no host name");
    };
    if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
        eprintln!("API host should not contain a path. Removed it.");
    }
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

fn print_results(results: &DatasetOptimizationResults<IndexedFrame>) {
    println!("Results archive: {}", results.cached_archive_path.display());
    let tables = [
        ("suspects", &results.suspects),
        ("object suspects", &results.object_suspects),
        ("warnings and errors", &results.warnings_and_errors),
    ];
    for (label, table) in tables {
        match table {
            Some(frame) => println!("{label}: {} rows x {} columns", frame.height(), frame.width()),
            None => println!("{label}: not available"),
        }
    }
}
