use crate::backend::{HistoryQuery, HttpBackend};
use crate::model::{InputAsset, Mode, RunConfig, RunEvent, RunStatus, TaskStatus};
use crate::orchestrator::{run_controller, Coordinator, OutputTargets, RunRequest, UiCommand};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "liveness-cli",
    version,
    about = "Face liveness detection client with optional TUI"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Base URL of the detection service
    #[arg(
        long,
        env = "LIVENESS_API_BASE_URL",
        default_value = "http://localhost:8000",
        global = true
    )]
    pub base_url: String,

    /// API key; falls back to the key saved by `activate`
    #[arg(long, env = "LIVENESS_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Detection mode
    #[arg(long, value_enum, default_value_t = Mode::Single)]
    pub mode: Mode,

    /// Image files to analyze (fusion mode expects rgb_<id> / ir_<id> names)
    pub images: Vec<PathBuf>,

    /// Print JSON result and exit (no TUI)
    #[arg(long, global = true)]
    pub json: bool,

    /// Print text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for scripted usage)
    #[arg(long)]
    pub silent: bool,

    /// How long to wait for the event stream to confirm the connection
    #[arg(long, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// How long to wait for the service to accept a job
    #[arg(long, default_value = "30s")]
    pub submit_timeout: humantime::Duration,

    /// Event stream heartbeat interval
    #[arg(long, default_value = "30s")]
    pub heartbeat_interval: humantime::Duration,

    /// Image formats accepted by the service
    #[arg(long, value_delimiter = ',', default_value = "jpg,jpeg,png,bmp,webp")]
    pub formats: Vec<String>,

    /// Largest accepted image, in MB
    #[arg(long, default_value_t = 10)]
    pub max_file_size_mb: u64,

    /// Export results as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export results as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Automatically start detection when the TUI launches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List past detection tasks recorded by the service
    History {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        #[arg(long, value_enum)]
        status: Option<TaskStatus>,
        /// Only tasks from the last N days
        #[arg(long)]
        days: Option<u32>,
    },
    /// Aggregate detection statistics
    Stats {
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },
    /// Delete history records
    Delete {
        #[arg(required = true)]
        task_ids: Vec<String>,
    },
    /// Exchange an activation code (ACT-...) for an API key and save it
    Activate { code: String },
}

pub async fn run(args: Cli) -> Result<()> {
    if let Some(cmd) = args.command.clone() {
        return run_command(&args, cmd).await;
    }

    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }
    if args.images.is_empty() {
        return Err(anyhow::anyhow!("no images given; pass one or more image paths"));
    }

    if args.silent {
        return run_headless(args, Output::Silent).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_headless(args, Output::Text).await;
        }
    }

    if args.json {
        return run_headless(args, Output::Json).await;
    }

    run_headless(args, Output::Text).await
}

/// Generate a random id for an input asset.
fn gen_asset_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Read image files into input assets.
pub fn load_inputs(paths: &[PathBuf]) -> Result<Vec<InputAsset>> {
    paths
        .iter()
        .map(|p| {
            let bytes = std::fs::read(p).with_context(|| format!("read {}", p.display()))?;
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string());
            Ok(InputAsset::new(gen_asset_id(), name, bytes))
        })
        .collect()
}

/// API key from flags/env, else from the saved license.
pub fn resolve_api_key(args: &Cli) -> Result<String> {
    if let Some(key) = args.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        return Ok(key.to_string());
    }
    match crate::storage::load_license()? {
        Some(license) => {
            tracing::debug!("using API key from saved license");
            Ok(license.api_key)
        }
        None => Err(anyhow::anyhow!(
            "no API key: pass --api-key, set LIVENESS_API_KEY or run `liveness-cli activate <code>`"
        )),
    }
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli, api_key: String) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        api_key,
        connect_timeout: Duration::from(args.connect_timeout),
        submit_timeout: Duration::from(args.submit_timeout),
        heartbeat_interval: Duration::from(args.heartbeat_interval),
        supported_formats: args
            .formats
            .iter()
            .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect(),
        max_file_size_mb: args.max_file_size_mb,
        user_agent: format!("liveness-cli/{}", env!("CARGO_PKG_VERSION")),
    }
}

pub(crate) fn output_targets(args: &Cli) -> OutputTargets {
    OutputTargets {
        auto_save: args.auto_save,
        export_json: args.export_json.clone(),
        export_csv: args.export_csv.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Json,
    Text,
    Silent,
}

/// Run one detection without the TUI and print the outcome.
async fn run_headless(args: Cli, output: Output) -> Result<()> {
    let cfg = build_config(&args, resolve_api_key(&args)?);
    let inputs = load_inputs(&args.images)?;
    let backend = Arc::new(HttpBackend::new(&cfg).context("build HTTP client")?);

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let coordinator = Coordinator::new(backend, &cfg).with_events(evt_tx.clone());
    let request = RunRequest {
        base_url: cfg.base_url.clone(),
        mode: args.mode,
        inputs,
        targets: output_targets(&args),
    };

    let (out_tx, out_handle) = spawn_output_writer();
    let controller = run_controller(coordinator, request, true, evt_tx, cmd_rx);
    let printer = async {
        while let Some(ev) = evt_rx.recv().await {
            let line = match ev {
                RunEvent::Processed { .. } => {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    None
                }
                RunEvent::Finished { .. } => None,
                _ if output != Output::Text => match ev {
                    RunEvent::Info(msg) if output == Output::Json => Some(msg),
                    _ => None,
                },
                RunEvent::StatusChanged { status } => Some(format!("== {status:?} ==")),
                RunEvent::Progress {
                    percent,
                    processed,
                    total,
                } => Some(format!("Progress: {percent}% ({processed}/{total})")),
                RunEvent::ResultAppended { item } => Some(match item.error_detail {
                    Some(err) => format!("Result: error ({err})"),
                    None => format!(
                        "Result: {} {:.1}% in {} ms",
                        item.outcome.as_str(),
                        item.confidence * 100.0,
                        item.elapsed_ms
                    ),
                }),
                RunEvent::Info(msg) => Some(msg),
            };
            if let Some(line) = line {
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
        }
    };
    let (report, ()) = tokio::join!(controller, printer);
    let report = report?.context("detection run did not finish")?;

    match output {
        Output::Json => {
            let out = serde_json::to_string_pretty(&report)?;
            let _ = out_tx.send(OutputLine::Stdout(out));
        }
        Output::Text => {
            for line in crate::text_summary::build_text_summary(&report).lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
        Output::Silent => {}
    }
    drop(out_tx);
    let _ = out_handle.await;

    if report.status == RunStatus::Error {
        return Err(anyhow::anyhow!(
            "detection failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

async fn run_command(args: &Cli, cmd: Command) -> Result<()> {
    if let Command::Activate { code } = &cmd {
        return activate(args, code).await;
    }
    let api_key = resolve_api_key(args)?;
    let backend = HttpBackend::new(&build_config(args, api_key.clone()))?;

    match cmd {
        Command::History {
            page,
            page_size,
            client_id,
            mode,
            status,
            days,
        } => {
            let query = HistoryQuery {
                page,
                page_size,
                client_id,
                mode: mode.map(|m| m.as_str().to_string()),
                status,
                days,
            };
            let result = backend.query_history(&query, &api_key).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            println!(
                "Page {}/{} ({} tasks)",
                result.page, result.total_pages, result.total
            );
            for t in &result.items {
                println!(
                    "{}  {:<6} {:<15} items {}/{} real {} fake {}  {} ms  {}",
                    t.task_id,
                    t.mode,
                    t.status.label(),
                    t.successful_items,
                    t.total_items,
                    t.real_count,
                    t.fake_count,
                    t.elapsed_time_ms,
                    t.created_at.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Stats { client_id, days } => {
            let stats = backend
                .history_stats(client_id.as_deref(), days, &api_key)
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            println!("Tasks:       {}", stats.total_tasks);
            println!("Inferences:  {}", stats.total_inferences);
            println!("Real / Fake: {} / {}", stats.total_real, stats.total_fake);
            println!("Errors:      {}", stats.total_errors);
            println!("Success:     {:.1}%", stats.success_rate * 100.0);
            println!("Avg time:    {:.1} ms", stats.avg_processing_time_ms);
        }
        Command::Delete { task_ids } => {
            let resp = backend.delete_history(&task_ids, &api_key).await?;
            println!("Deleted {} task(s). {}", resp.deleted, resp.message);
        }
        Command::Activate { .. } => {}
    }
    Ok(())
}

async fn activate(args: &Cli, code: &str) -> Result<()> {
    let backend = HttpBackend::new(&build_config(args, String::new()))?;
    let activation = backend.activate(code.trim()).await?;
    let license = crate::storage::License {
        api_key: activation.api_key,
        activated_at: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        expires_at: activation.expires_at,
    };
    let path = crate::storage::save_license(&license)?;
    if !activation.message.is_empty() {
        println!("{}", activation.message);
    }
    println!("License saved: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_a_complete_config() {
        let args = Cli::try_parse_from(["liveness-cli", "--api-key", "k", "a.jpg"]).unwrap();
        let cfg = build_config(&args, "k".into());
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.submit_timeout, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.supported_formats, vec!["jpg", "jpeg", "png", "bmp", "webp"]);
        assert_eq!(cfg.max_file_size_mb, 10);
        assert_eq!(args.mode, Mode::Single);
        assert_eq!(args.images, vec![PathBuf::from("a.jpg")]);
    }

    #[test]
    fn formats_are_normalized() {
        let args = Cli::try_parse_from([
            "liveness-cli",
            "--formats",
            ".JPG, png,",
            "--mode",
            "fusion",
            "--connect-timeout",
            "2s",
        ])
        .unwrap();
        let cfg = build_config(&args, String::new());
        assert_eq!(cfg.supported_formats, vec!["jpg", "png"]);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
        assert_eq!(args.mode, Mode::Fusion);
    }

    #[test]
    fn subcommands_parse() {
        let args =
            Cli::try_parse_from(["liveness-cli", "history", "--status", "partial-failure", "--days", "7"])
                .unwrap();
        match args.command {
            Some(Command::History { status, days, .. }) => {
                assert_eq!(status, Some(TaskStatus::PartialFailure));
                assert_eq!(days, Some(7));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["liveness-cli", "delete"]).is_err());
    }

    #[test]
    fn explicit_api_key_wins() {
        let args = Cli::try_parse_from(["liveness-cli", "--api-key", "from-flag"]).unwrap();
        assert_eq!(resolve_api_key(&args).unwrap(), "from-flag");
    }

    #[test]
    fn inputs_take_file_names_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir_007.PNG");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let inputs = load_inputs(&[path]).unwrap();
        assert_eq!(inputs[0].name, "ir_007.PNG");
        assert_eq!(inputs[0].format, "png");
        assert_eq!(inputs[0].bytes, vec![1, 2, 3]);
        assert_eq!(inputs[0].id.len(), 16);

        assert!(load_inputs(&[dir.path().join("missing.jpg")]).is_err());
    }
}
