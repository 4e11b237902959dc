use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use job_sync::{
    CancelAck, JobCallbacks, JobId, JobKind, NotebookId, SyncClient, SyncConfig, SyncEvent,
};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "jobwatch", version, about = "Submit, follow and cancel background jobs")]
struct Cli {
    /// Base URL of the job API, e.g. http://localhost:8000/api
    #[arg(long, env = "JOB_SYNC_API_BASE_URL", global = true)]
    api_url: Option<String>,

    /// Bearer token attached to every request
    #[arg(long, env = "JOB_SYNC_BEARER_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "JOBWATCH_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a new job and print its id
    Submit {
        #[command(flatten)]
        scope: Scope,
        /// Extra request fields as key=value; values are parsed as JSON when possible
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        /// Keep following the job until it settles
        #[arg(long)]
        follow: bool,
    },
    /// Follow a job until it completes or fails
    Track {
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        job: String,
    },
    /// Cancel a job and wait for the outcome
    Cancel {
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        job: String,
    },
}

#[derive(Args, Debug)]
struct Scope {
    /// report, podcast or parse
    #[arg(long)]
    kind: JobKind,
    #[arg(long)]
    notebook: String,
}

#[derive(Debug)]
enum Outcome {
    Completed(Option<Value>),
    Failed(String),
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing(log_file: Option<&PathBuf>) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(log_file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow!("failed to configure logger: {err}"))?;
    Ok(guard)
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut cfg = SyncConfig::from_env().context("loading JOB_SYNC_* configuration")?;
    if let Some(url) = &cli.api_url {
        cfg.api_base_url = url.trim().to_string();
    }
    if let Some(token) = cli.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        cfg.bearer_token = Some(token.to_string());
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_guard = init_tracing(cli.log_file.as_ref())?;

    let cfg = load_config(&cli)?;
    info!(api = %cfg.api_base_url, "jobwatch starting");
    let client = SyncClient::new(cfg)?;

    let result = run(&client, cli.command).await;
    client.close().await;

    match result? {
        Some(Outcome::Failed(message)) => {
            eprintln!("job failed: {message}");
            drop(log_guard);
            std::process::exit(1);
        }
        _ => Ok(()),
    }
}

async fn run(client: &SyncClient, command: Command) -> anyhow::Result<Option<Outcome>> {
    match command {
        Command::Submit {
            scope,
            params,
            follow,
        } => {
            let notebook = NotebookId::new(scope.notebook);
            let params: Map<String, Value> = params.into_iter().collect();
            let job_id = client.submit(scope.kind, &notebook, params).await?;
            println!("{job_id}");
            if !follow {
                return Ok(None);
            }
            follow_job(client, job_id, scope.kind, notebook, false).await.map(Some)
        }
        Command::Track { scope, job } => follow_job(
            client,
            JobId::new(job),
            scope.kind,
            NotebookId::new(scope.notebook),
            false,
        )
        .await
        .map(Some),
        Command::Cancel { scope, job } => follow_job(
            client,
            JobId::new(job),
            scope.kind,
            NotebookId::new(scope.notebook),
            true,
        )
        .await
        .map(Some),
    }
}

async fn follow_job(
    client: &SyncClient,
    job_id: JobId,
    kind: JobKind,
    notebook: NotebookId,
    cancel: bool,
) -> anyhow::Result<Outcome> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (done, failed) = (tx.clone(), tx);
    let callbacks = JobCallbacks::new()
        .on_progress(|snapshot| {
            if snapshot.progress.is_empty() {
                println!("[{}] {}", snapshot.job_id, snapshot.status);
            } else {
                println!("[{}] {} {}", snapshot.job_id, snapshot.status, snapshot.progress);
            }
        })
        .on_complete(move |snapshot| {
            let _ = done.send(Outcome::Completed(snapshot.result.clone()));
        })
        .on_error(move |failure| {
            let _ = failed.send(Outcome::Failed(failure.message.clone()));
        });

    let mut events = client.subscribe_events();
    let _subscription = client.track(job_id.clone(), kind, notebook, callbacks)?;

    if cancel {
        match client.cancel(&job_id).await? {
            CancelAck::Requested => println!("[{job_id}] cancel requested"),
            CancelAck::AlreadyGone => println!("[{job_id}] job no longer exists on the server"),
        }
    }

    loop {
        tokio::select! {
            outcome = rx.recv() => {
                let Some(outcome) = outcome else {
                    bail!("tracker for {job_id} ended without an outcome");
                };
                if let Outcome::Completed(result) = &outcome {
                    match result {
                        Some(result) => println!("[{job_id}] completed {result}"),
                        None => println!("[{job_id}] completed"),
                    }
                }
                return Ok(outcome);
            }
            event = events.recv() => match event {
                Ok(SyncEvent::ConnectionState { target, state }) => {
                    info!(stream = %target, %state, "connection state");
                }
                Ok(SyncEvent::RefreshAll { target }) => {
                    info!(stream = %target, "stream asked for a full refresh");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    bail!("client closed while waiting for {job_id}");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                bail!("interrupted while waiting for {job_id}");
            }
        }
    }
}
