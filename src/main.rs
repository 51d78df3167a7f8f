//! apprack: supervises local web apps, one state machine per app.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads `apprack.toml`, starts a runtime supervisor for every
//! selected app and then prints logs and status changes while reading
//! control commands from stdin.

mod config;
mod control;
mod diagnostics;
mod events;
mod machine;
mod model;
mod publisher;
mod registry;
mod runner;
mod spawn;
mod supervisor;

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

use crate::control::{ControlCommand, Target};
use crate::diagnostics::TracingDiagnostics;
use crate::machine::{RuntimeSnapshot, RuntimeStatus, State};
use crate::model::{LogEntry, LogKind};
use crate::publisher::{Notification, Publisher};
use crate::registry::Registry;
use crate::runner::ProcessSpawner;
use crate::supervisor::{Collaborators, RuntimeHandle};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "apprack",
    version,
    about = "Supervise local web apps with idle shutdown and retries",
    styles = help_styles()
)]
struct Cli {
    /// Path to apprack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Send a heartbeat to every running app every SECS seconds.
    #[arg(long, value_name = "SECS")]
    keep_alive: Option<u64>,
    /// Print logs and status as JSON lines.
    #[arg(long)]
    json: bool,
    /// Tracing filter for diagnostics on stderr (overrides RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,
    /// Apps to start (defaults to every configured app).
    apps: Vec<String>,
}

/// Everything the main loop reacts to.
#[derive(Debug)]
enum HostEvent {
    Line(String),
    Notification(Notification),
    Status(RuntimeStatus),
    KeepAlive,
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    let config_path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or_else(|| anyhow!("no apprack.toml found (use --config PATH)"))?;
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let resolved = config::load_config(&config_path)?
        .resolve(&base_dir)
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    if resolved.apps.is_empty() {
        bail!("no apps defined in {}", config_path.display());
    }

    let publisher = Publisher::new(NOTIFICATION_CAPACITY);
    let collaborators = Collaborators {
        spawner: Arc::new(ProcessSpawner::new(resolved.spawn)),
        publisher: publisher.clone(),
        diagnostics: Arc::new(TracingDiagnostics),
    };
    let mut registry = Registry::new(
        resolved.apps,
        resolved.runner,
        resolved.supervisor,
        collaborators,
    );

    let (event_tx, mut event_rx) = mpsc::channel(256);
    spawn_notification_listener(publisher.subscribe(), event_tx.clone());
    spawn_signal_listener(event_tx.clone());
    spawn_stdin_listener(event_tx.clone());
    if let Some(secs) = cli.keep_alive.filter(|secs| *secs > 0) {
        spawn_keep_alive(Duration::from_secs(secs), event_tx.clone());
    }

    let selected = if cli.apps.is_empty() {
        registry.subdomains()
    } else {
        cli.apps.clone()
    };
    for subdomain in &selected {
        ensure_started(&mut registry, subdomain, &event_tx)?;
    }

    let mut printer = Printer::new(cli.json);
    while let Some(event) = event_rx.recv().await {
        match event {
            HostEvent::Line(line) => match control::parse_line(&line) {
                Ok(Some(ControlCommand::Quit)) => break,
                Ok(Some(command)) => {
                    if let Err(err) =
                        run_command(command, &mut registry, &mut printer, &event_tx).await
                    {
                        printer.tool_message(&err.to_string());
                    }
                }
                Ok(None) => {}
                Err(err) => printer.tool_message(&err.to_string()),
            },
            HostEvent::Notification(notification) => {
                let Some(handle) = registry.get(notification.subdomain()) else {
                    continue;
                };
                let after = printer.last_seen(handle.subdomain());
                match handle.logs_since(after).await {
                    Ok(entries) => printer.print_new_logs(handle.subdomain(), &entries),
                    Err(err) => debug!(%err, "log notification for a stopped supervisor"),
                }
            }
            HostEvent::Status(status) => printer.print_status_change(&status),
            HostEvent::KeepAlive => {
                let now = Utc::now();
                for handle in registry.running() {
                    if let Err(err) = handle.update_heartbeat(now).await {
                        warn!(
                            subdomain = handle.subdomain(),
                            %err,
                            "keep-alive heartbeat not delivered"
                        );
                    }
                }
            }
            HostEvent::Shutdown => break,
        }
    }

    printer.tool_message("shutting down");
    registry.shutdown_all().await;
    Ok(())
}

async fn run_command(
    command: ControlCommand,
    registry: &mut Registry,
    printer: &mut Printer,
    event_tx: &mpsc::Sender<HostEvent>,
) -> Result<()> {
    match command {
        ControlCommand::Restart(Target::All) => {
            for handle in registry.running() {
                handle.restart().await?;
            }
        }
        ControlCommand::Restart(Target::App(subdomain)) => {
            if registry.get(&subdomain).is_some() {
                running(registry, &subdomain)?.restart().await?;
            } else {
                ensure_started(registry, &subdomain, event_tx)?;
            }
        }
        ControlCommand::Clear(target) => {
            for handle in targets(registry, &target)? {
                handle.clear_logs().await?;
            }
        }
        ControlCommand::Heartbeat(Target::All) => {
            let now = Utc::now();
            for handle in registry.running() {
                handle.update_heartbeat(now).await?;
            }
        }
        ControlCommand::Heartbeat(Target::App(subdomain)) => {
            let handle = ensure_started(registry, &subdomain, event_tx)?;
            handle.update_heartbeat(Utc::now()).await?;
        }
        ControlCommand::SaveError { app, message } => {
            running(registry, &app)?
                .save_error(message, Some("manual".to_string()))
                .await?;
        }
        ControlCommand::Status(None) => {
            if registry.running().next().is_none() {
                printer.tool_message("no apps running");
            }
            for handle in registry.running() {
                printer.print_status(&handle.status());
            }
        }
        ControlCommand::Status(Some(subdomain)) => {
            printer.print_status(&running(registry, &subdomain)?.status());
        }
        ControlCommand::Logs(subdomain) => {
            let snapshot = running(registry, &subdomain)?.snapshot().await?;
            printer.print_all_logs(&snapshot);
        }
        ControlCommand::Stop(subdomain) => {
            if !registry.remove(&subdomain).await {
                bail!("{} is not running", subdomain);
            }
            printer.forget(&subdomain);
            printer.tool_message(&format!("{}: supervisor stopped", subdomain));
        }
        ControlCommand::Help => println!("{}", control::HELP),
        ControlCommand::Quit => {}
    }
    Ok(())
}

fn running<'a>(registry: &'a Registry, subdomain: &str) -> Result<&'a RuntimeHandle> {
    registry
        .get(subdomain)
        .ok_or_else(|| anyhow!("{} is not running", subdomain))
}

fn targets<'a>(registry: &'a Registry, target: &Target) -> Result<Vec<&'a RuntimeHandle>> {
    match target {
        Target::All => Ok(registry.running().collect()),
        Target::App(subdomain) => Ok(vec![running(registry, subdomain)?]),
    }
}

/// Starts `subdomain` if needed and forwards its status changes to the main loop.
fn ensure_started(
    registry: &mut Registry,
    subdomain: &str,
    event_tx: &mpsc::Sender<HostEvent>,
) -> Result<RuntimeHandle> {
    let fresh = registry.get(subdomain).is_none();
    let handle = registry.get_or_start(subdomain)?;
    if fresh {
        spawn_status_listener(&handle, event_tx.clone());
    }
    Ok(handle)
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => {
            EnvFilter::try_new(level).with_context(|| format!("invalid log level {}", level))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("apprack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn spawn_status_listener(handle: &RuntimeHandle, tx: mpsc::Sender<HostEvent>) {
    let mut status = handle.watch_status();
    tokio::spawn(async move {
        let initial = status.borrow_and_update().clone();
        if tx.send(HostEvent::Status(initial)).await.is_err() {
            return;
        }
        // Ends when the supervisor task drops its sender.
        while status.changed().await.is_ok() {
            let next = status.borrow_and_update().clone();
            if tx.send(HostEvent::Status(next)).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_notification_listener(
    mut rx: broadcast::Receiver<Notification>,
    tx: mpsc::Sender<HostEvent>,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    if tx.send(HostEvent::Notification(notification)).await.is_err() {
                        break;
                    }
                }
                // Logs are fetched by last printed id, so the next notification catches up.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "log notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_keep_alive(period: Duration, tx: mpsc::Sender<HostEvent>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(HostEvent::KeepAlive).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<HostEvent>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(HostEvent::Shutdown).await;
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<HostEvent>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(HostEvent::Line(line)).is_err() {
                break;
            }
        }
    });
}

/// Tracks what has already been printed per app.
struct Printer {
    json: bool,
    last_log: HashMap<String, Ulid>,
    last_state: HashMap<String, State>,
}

impl Printer {
    fn new(json: bool) -> Self {
        Self {
            json,
            last_log: HashMap::new(),
            last_state: HashMap::new(),
        }
    }

    fn tool_message(&self, text: &str) {
        if self.json {
            println!("{}", serde_json::json!({ "type": "message", "message": text }));
        } else {
            println!("{}", format_tool_message(text));
        }
    }

    /// Id of the last log entry printed for `subdomain`.
    fn last_seen(&self, subdomain: &str) -> Option<Ulid> {
        self.last_log.get(subdomain).copied()
    }

    /// Prints entries fetched with [`Printer::last_seen`] and remembers the newest.
    fn print_new_logs(&mut self, subdomain: &str, entries: &[LogEntry]) {
        for entry in entries {
            self.print_log(subdomain, entry);
        }
        if let Some(entry) = entries.last() {
            self.last_log.insert(subdomain.to_string(), entry.id);
        }
    }

    fn print_all_logs(&mut self, snapshot: &RuntimeSnapshot) {
        for entry in &snapshot.logs {
            self.print_log(&snapshot.subdomain, entry);
        }
        for error in &snapshot.errors {
            self.tool_message(&format!("{}: error: {}", snapshot.subdomain, error.message));
        }
        if let Some(entry) = snapshot.logs.last() {
            self.last_log.insert(snapshot.subdomain.clone(), entry.id);
        }
    }

    fn print_log(&self, subdomain: &str, entry: &LogEntry) {
        if self.json {
            println!(
                "{}",
                serde_json::json!({ "type": "log", "subdomain": subdomain, "entry": entry })
            );
        } else {
            println!("{}", format_log_line(subdomain, entry));
        }
    }

    /// Prints `status` only if the app moved to a different state.
    fn print_status_change(&mut self, status: &RuntimeStatus) {
        let previous = self.last_state.insert(status.subdomain.clone(), status.state);
        if previous != Some(status.state) {
            self.print_status(status);
        }
    }

    fn print_status(&self, status: &RuntimeStatus) {
        if self.json {
            println!(
                "{}",
                serde_json::json!({ "type": "status", "status": status })
            );
        } else {
            self.tool_message(&format!("{}: {}", status.subdomain, describe_status(status)));
        }
    }

    fn forget(&mut self, subdomain: &str) {
        self.last_log.remove(subdomain);
        self.last_state.remove(subdomain);
    }
}

fn format_log_line(subdomain: &str, entry: &LogEntry) -> String {
    match entry.kind {
        LogKind::Error => format!("[{}] \x1b[31m{}\x1b[0m", subdomain, entry.message),
        LogKind::Normal | LogKind::Truncation => format!("[{}] {}", subdomain, entry.message),
    }
}

fn format_tool_message(text: &str) -> String {
    format!("[apprack] {}", text)
}

fn describe_status(status: &RuntimeStatus) -> String {
    match status.state {
        State::SpawningRuntime if status.retry_count > 0 => {
            format!("starting (retry {})", status.retry_count)
        }
        State::SpawningRuntime => "starting".to_string(),
        State::Running => match status.port {
            Some(port) => format!("ready on http://localhost:{}", port),
            None => "ready".to_string(),
        },
        State::PendingShutdown => "idle, shutting down soon".to_string(),
        State::Stopped => "stopped (heartbeat to resume)".to_string(),
        State::Restarting => "restarting".to_string(),
        State::MaybeRetrying => "retrying".to_string(),
        State::Error => format!("failed with {} error(s)", status.error_count),
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Generator;

    fn status(state: State, port: Option<u16>, retry_count: u32) -> RuntimeStatus {
        RuntimeStatus {
            subdomain: "blog".to_string(),
            state,
            tag: state.tag(),
            port,
            retry_count,
            log_count: 0,
            error_count: 2,
            last_heartbeat: Utc::now(),
        }
    }

    fn entries(messages: &[&str]) -> Vec<LogEntry> {
        let mut ids = Generator::new();
        messages
            .iter()
            .map(|message| LogEntry {
                id: ids.generate().unwrap(),
                created_at: Utc::now(),
                message: message.to_string(),
                kind: LogKind::Normal,
            })
            .collect()
    }

    #[test]
    fn printer_remembers_last_printed_entry() {
        let mut printer = Printer::new(true);
        assert_eq!(printer.last_seen("blog"), None);
        let logs = entries(&["a", "b"]);
        printer.print_new_logs("blog", &logs);
        assert_eq!(printer.last_seen("blog"), Some(logs[1].id));
        printer.print_new_logs("blog", &[]);
        assert_eq!(printer.last_seen("blog"), Some(logs[1].id));
        assert_eq!(printer.last_seen("shop"), None);
        printer.forget("blog");
        assert_eq!(printer.last_seen("blog"), None);
    }

    #[test]
    fn formats_lines() {
        let mut logs = entries(&["listening"]);
        assert_eq!(format_log_line("blog", &logs[0]), "[blog] listening");
        logs[0].kind = LogKind::Error;
        assert_eq!(
            format_log_line("blog", &logs[0]),
            "[blog] \x1b[31mlistening\x1b[0m"
        );
        assert_eq!(format_tool_message("shutting down"), "[apprack] shutting down");
    }

    #[test]
    fn describes_status() {
        assert_eq!(
            describe_status(&status(State::Running, Some(3001), 0)),
            "ready on http://localhost:3001"
        );
        assert_eq!(
            describe_status(&status(State::SpawningRuntime, None, 2)),
            "starting (retry 2)"
        );
        assert_eq!(
            describe_status(&status(State::Error, None, 0)),
            "failed with 2 error(s)"
        );
    }

    #[test]
    fn status_changes_print_once_per_state() {
        let mut printer = Printer::new(true);
        printer.print_status_change(&status(State::SpawningRuntime, None, 0));
        assert_eq!(printer.last_state.get("blog"), Some(&State::SpawningRuntime));
        printer.print_status_change(&status(State::Running, Some(3000), 0));
        assert_eq!(printer.last_state.get("blog"), Some(&State::Running));
        printer.forget("blog");
        assert!(printer.last_state.is_empty());
    }

    #[test]
    fn cli_parses_apps_and_flags() {
        let cli = Cli::try_parse_from(["apprack", "--keep-alive", "10", "--json", "blog", "shop"])
            .unwrap();
        assert_eq!(cli.keep_alive, Some(10));
        assert!(cli.json);
        assert_eq!(cli.apps, vec!["blog", "shop"]);
        assert!(cli.config.is_none());
    }
}
