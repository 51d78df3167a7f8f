//! Process spawn actor.
//!
//! [`ProcessSpawner`] launches a project's dev script as a child process and
//! reports its progress to the owning supervisor. One attempt runs as one
//! tokio task:
//!
//! 1. validate `package.json` and the requested script,
//! 2. run the install command, if any,
//! 3. wait, for a bounded time, until the attempt's port is free,
//! 4. spawn the script with `PORT` set and stream its output,
//! 5. report `started` once the port accepts connections.
//!
//! Cancelling the attempt's token stops the child with a SIGINT → SIGTERM →
//! kill escalation and ends the task without further reports.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{AppConfig, ScriptRunner, SpawnSettings};
use crate::events::{SpawnError, SpawnErrorKind, SpawnEvent};
use crate::model::{sanitize_text, truncate_line, LogKind};
use crate::spawn::{SpawnInput, SpawnReporter, Spawner};

const READINESS_POLL: Duration = Duration::from_millis(250);
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
const PORT_RETRY: Duration = Duration::from_millis(100);
const PORT_RELEASE_SLACK: Duration = Duration::from_secs(1);

/// Indicates the source stream of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessSignal {
    SigInt,
    SigTerm,
}

/// Spawns dev servers as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner {
    settings: SpawnSettings,
}

impl ProcessSpawner {
    pub fn new(settings: SpawnSettings) -> Self {
        Self { settings }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, input: SpawnInput) {
        let span = info_span!(
            "spawn",
            spawn = %input.reporter.spawn_id(),
            attempt = input.attempt
        );
        tokio::spawn(run_attempt(input, self.settings).instrument(span));
    }
}

async fn run_attempt(input: SpawnInput, settings: SpawnSettings) {
    let SpawnInput {
        app,
        attempt,
        runner,
        reporter,
        cancel,
    } = input;

    let prepared = prepare(&app, &runner, attempt, &reporter, &settings, &cancel).await;
    let (mut child, port, command_line) = match prepared {
        Ok(Some(prepared)) => prepared,
        Ok(None) => return,
        Err(_) if cancel.is_cancelled() => return,
        Err(err) => {
            warn!(error = %err, "startup failed");
            reporter.report(SpawnEvent::Error(err)).await;
            return;
        }
    };

    let (line_tx, mut lines) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_stream(StreamKind::Stdout, stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_stream(StreamKind::Stderr, stderr, line_tx));
    }

    let deadline = tokio::time::sleep(settings.startup_timeout);
    tokio::pin!(deadline);
    let listening = wait_until_listening(port);
    tokio::pin!(listening);
    let mut started = false;
    let mut port_conflict = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_child(&mut child, &settings).await;
                return;
            }
            Some((stream, line)) = lines.recv() => {
                if !started && is_address_in_use(&line) {
                    port_conflict = true;
                }
                reporter.report(log_event(stream, &line, settings.max_line_length)).await;
            }
            _ = &mut listening, if !started => {
                started = true;
                info!(port, "app is accepting connections");
                reporter.report(SpawnEvent::Started { port }).await;
            }
            _ = &mut deadline, if !started => {
                stop_child(&mut child, &settings).await;
                let err = SpawnError::new(
                    SpawnErrorKind::Timeout,
                    format!(
                        "no connection on port {} after {}s",
                        port,
                        settings.startup_timeout.as_secs()
                    ),
                )
                .with_command(command_line.clone());
                reporter.report(SpawnEvent::Error(err)).await;
                return;
            }
            status = child.wait() => {
                // Pick up output still in flight from the readers.
                while let Ok(Some((stream, line))) =
                    tokio::time::timeout(OUTPUT_DRAIN, lines.recv()).await
                {
                    if !started && is_address_in_use(&line) {
                        port_conflict = true;
                    }
                    reporter.report(log_event(stream, &line, settings.max_line_length)).await;
                }
                let code = status.ok().and_then(|status| status.code());
                debug!(?code, started, "app process exited");
                let event = if !started && port_conflict {
                    SpawnEvent::Error(
                        SpawnError::new(
                            SpawnErrorKind::PortTaken,
                            format!("port {} is already in use", port),
                        )
                        .with_command(command_line.clone()),
                    )
                } else {
                    SpawnEvent::Exited
                };
                reporter.report(event).await;
                return;
            }
        }
    }
}

// Runs every step up to and including the spawn of the dev script.
// Returns `None` if the attempt was cancelled on the way.
async fn prepare(
    app: &AppConfig,
    runner: &ScriptRunner,
    attempt: u32,
    reporter: &SpawnReporter,
    settings: &SpawnSettings,
    cancel: &CancellationToken,
) -> Result<Option<(Child, u16, String)>, SpawnError> {
    check_manifest(app).await?;
    if let Some(install) = &app.install {
        run_install(app, install, reporter, settings, cancel).await?;
    }
    if cancel.is_cancelled() {
        return Ok(None);
    }

    let port = attempt_port(app.base_port, attempt);
    tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        claimed = claim_port(port, port_release_window(settings)) => claimed?,
    }

    let argv = runner.argv(&app.script);
    let command_line = shell_words::join(&argv);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SpawnError::new(SpawnErrorKind::Unknown, "empty runner command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&app.cwd)
        .envs(&app.env)
        .env("PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolate_process_group(&mut command);

    info!(command = %command_line, port, "starting app");
    let child = command.spawn().map_err(|err| {
        SpawnError::new(SpawnErrorKind::Unknown, format!("failed to spawn: {}", err))
            .with_command(command_line.clone())
    })?;
    Ok(Some((child, port, command_line)))
}

fn attempt_port(base: u16, attempt: u32) -> u16 {
    base.saturating_add(u16::try_from(attempt).unwrap_or(u16::MAX))
}

async fn check_manifest(app: &AppConfig) -> Result<(), SpawnError> {
    let path = app.cwd.join("package.json");
    let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
        SpawnError::new(
            SpawnErrorKind::PackageJson,
            format!("failed to read {}: {}", path.display(), err),
        )
    })?;
    validate_manifest(&raw, &app.script)
}

/// Checks that `raw` is a package manifest defining `script`.
pub fn validate_manifest(raw: &str, script: &str) -> Result<(), SpawnError> {
    let manifest: Value = serde_json::from_str(raw).map_err(|err| {
        SpawnError::new(
            SpawnErrorKind::PackageJson,
            format!("invalid package.json: {}", err),
        )
    })?;
    if !manifest.is_object() {
        return Err(SpawnError::new(
            SpawnErrorKind::PackageJson,
            "package.json must contain an object",
        ));
    }
    match manifest.get("scripts") {
        None | Some(Value::Null) => Err(SpawnError::new(
            SpawnErrorKind::UnsupportedScript,
            format!("package.json has no scripts; expected \"{}\"", script),
        )),
        Some(Value::Object(scripts)) => match scripts.get(script) {
            Some(Value::String(body)) if !body.trim().is_empty() => Ok(()),
            Some(_) => Err(SpawnError::new(
                SpawnErrorKind::UnsupportedScript,
                format!("script \"{}\" is empty or not a string", script),
            )),
            None => Err(SpawnError::new(
                SpawnErrorKind::UnsupportedScript,
                format!("script \"{}\" not found in package.json", script),
            )),
        },
        Some(_) => Err(SpawnError::new(
            SpawnErrorKind::PackageJson,
            "\"scripts\" must be an object",
        )),
    }
}

// Stops the install on cancellation and returns `Ok`; the caller checks the token.
async fn run_install(
    app: &AppConfig,
    install: &str,
    reporter: &SpawnReporter,
    settings: &SpawnSettings,
    cancel: &CancellationToken,
) -> Result<(), SpawnError> {
    let failed = |message: String| {
        SpawnError::new(SpawnErrorKind::InstallFailed, message).with_command(install)
    };
    let mut parts = shell_words::split(install)
        .map_err(|err| failed(format!("failed to parse command: {}", err)))?;
    if parts.is_empty() {
        return Ok(());
    }
    let program = parts.remove(0);
    let mut command = Command::new(program);
    command
        .args(parts)
        .current_dir(&app.cwd)
        .envs(&app.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolate_process_group(&mut command);

    info!(command = install, "installing dependencies");
    let mut child = command
        .spawn()
        .map_err(|err| failed(format!("failed to spawn: {}", err)))?;

    let (line_tx, mut lines) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_stream(StreamKind::Stdout, stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_stream(StreamKind::Stderr, stderr, line_tx));
    }
    let report_line = |stream: StreamKind, line: String| {
        let line = format!("[install] {}", line);
        reporter.report(log_event(stream, &line, settings.max_line_length))
    };

    let status = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_child(&mut child, settings).await;
                return Ok(());
            }
            Some((stream, line)) = lines.recv() => {
                report_line(stream, line).await;
            }
            status = child.wait() => {
                while let Ok(Some((stream, line))) =
                    tokio::time::timeout(OUTPUT_DRAIN, lines.recv()).await
                {
                    report_line(stream, line).await;
                }
                break status;
            }
        }
    };
    let status = status.map_err(|err| failed(format!("failed to wait: {}", err)))?;
    if !status.success() {
        return Err(failed(match status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        }));
    }
    Ok(())
}

// The previous attempt on this port may still be stopping.
fn port_release_window(settings: &SpawnSettings) -> Duration {
    settings.sigint_grace + settings.sigterm_grace + PORT_RELEASE_SLACK
}

/// Waits up to `window` for `port` to be bindable.
async fn claim_port(port: u16, window: Duration) -> Result<(), SpawnError> {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                return Ok(());
            }
            Err(err) if tokio::time::Instant::now() >= deadline => {
                return Err(SpawnError::new(
                    SpawnErrorKind::PortTaken,
                    format!("port {} is already in use: {}", port, err),
                ));
            }
            Err(err) => {
                debug!(port, %err, "port busy, waiting for release");
                tokio::time::sleep(PORT_RETRY).await;
            }
        }
    }
}

async fn wait_until_listening(port: u16) {
    let addr = format!("127.0.0.1:{}", port);
    loop {
        if TcpStream::connect(&addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
}

fn is_address_in_use(line: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)EADDRINUSE|address already in use|port \d+ is (already )?in use").ok()
        })
        .as_ref()
        .map(|re| re.is_match(line))
        .unwrap_or(false)
}

fn log_event(stream: StreamKind, raw: &str, max_line_length: usize) -> SpawnEvent {
    let (message, truncated) = truncate_line(&sanitize_text(raw), max_line_length);
    let kind = match (truncated, stream) {
        (true, _) => LogKind::Truncation,
        (false, StreamKind::Stdout) => LogKind::Normal,
        (false, StreamKind::Stderr) => LogKind::Error,
    };
    SpawnEvent::Log { message, kind }
}

async fn read_stream<R>(stream: StreamKind, reader: R, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

// Stops the child, escalating from SIGINT to SIGTERM to kill.
async fn stop_child(child: &mut Child, settings: &SpawnSettings) {
    for (signal, grace) in [
        (ProcessSignal::SigInt, settings.sigint_grace),
        (ProcessSignal::SigTerm, settings.sigterm_grace),
    ] {
        if grace.is_zero() {
            continue;
        }
        let Some(pid) = child.id() else {
            return;
        };
        debug!(pid, ?signal, "signalling app process");
        send_os_signal(pid, signal);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!(code = ?status.code(), "app process stopped");
            return;
        }
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(windows)]
fn isolate_process_group(command: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn isolate_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(not(any(unix, windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}
