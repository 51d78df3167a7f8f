//! Configuration management for Apprack.
//!
//! This module defines the structure of the `apprack.toml` configuration file
//! and resolves it into the immutable settings handed to each supervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_LINE_LENGTH: usize = 4096;
const DEFAULT_SIGINT_MS: u64 = 2_000;
const DEFAULT_SIGTERM_MS: u64 = 2_000;
const DEFAULT_RUNNER: &str = "npm run";
const DEFAULT_SCRIPT: &str = "dev";
const DEFAULT_PORT: u16 = 3000;

/// Top-level configuration structure corresponding to `apprack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Time without a heartbeat before a running app is considered idle.
    pub idle_timeout_ms: Option<u64>,
    /// Grace window between idling and stopping the app.
    pub shutdown_timeout_ms: Option<u64>,
    /// Number of retryable startup failures tolerated before giving up.
    pub max_retries: Option<u32>,
    /// How long a spawned app may take to accept connections.
    pub startup_timeout_ms: Option<u64>,
    /// Log lines longer than this many characters are truncated.
    pub max_line_length: Option<usize>,
    /// Milliseconds to wait after SIGINT before escalating.
    pub shutdown_sigint_ms: Option<u64>,
    /// Milliseconds to wait after SIGTERM before killing.
    pub shutdown_sigterm_ms: Option<u64>,
    /// Command prefix used to run package scripts (e.g. "pnpm run").
    pub runner: Option<String>,
    /// Applications to supervise.
    #[serde(rename = "app", default)]
    pub apps: Vec<AppEntry>,
}

/// Configuration for a single application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppEntry {
    /// Unique key of the app.
    pub subdomain: String,
    /// Project directory containing `package.json`.
    pub cwd: String,
    /// Package script to run (default: "dev").
    pub script: Option<String>,
    /// First port to try; retries move up by the attempt number.
    pub port: Option<u16>,
    /// Install command run before the script.
    pub install: Option<String>,
    /// Environment variables to set for the app.
    pub env: Option<HashMap<String, String>>,
}

/// Identity and static configuration of a supervised application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppConfig {
    pub subdomain: String,
    pub cwd: PathBuf,
    pub script: String,
    pub base_port: u16,
    pub install: Option<String>,
    pub env: HashMap<String, String>,
}

/// How package scripts are executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRunner {
    /// Program and leading arguments, e.g. `["pnpm", "run"]`.
    pub command: Vec<String>,
}

impl ScriptRunner {
    /// Parses a runner command line such as `"npm run"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let command =
            shell_words::split(raw).with_context(|| format!("failed to parse runner {:?}", raw))?;
        if command.is_empty() {
            bail!("empty runner command");
        }
        Ok(Self { command })
    }

    /// Full argv for running `script`.
    pub fn argv(&self, script: &str) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(script.to_string());
        argv
    }
}

/// Timer and retry settings shared by every supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_retries: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Settings consumed by the process spawn actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnSettings {
    pub startup_timeout: Duration,
    pub max_line_length: usize,
    pub sigint_grace: Duration,
    pub sigterm_grace: Duration,
}

impl Default for SpawnSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            sigint_grace: Duration::from_millis(DEFAULT_SIGINT_MS),
            sigterm_grace: Duration::from_millis(DEFAULT_SIGTERM_MS),
        }
    }
}

/// Everything resolved from a `Config`.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub apps: Vec<AppConfig>,
    pub runner: ScriptRunner,
    pub supervisor: SupervisorSettings,
    pub spawn: SpawnSettings,
}

impl Config {
    /// Applies defaults and validates app entries.
    ///
    /// Relative `cwd` values are resolved against `base_dir`.
    pub fn resolve(self, base_dir: &Path) -> Result<Resolved> {
        let runner = ScriptRunner::parse(self.runner.as_deref().unwrap_or(DEFAULT_RUNNER))?;
        let supervisor = SupervisorSettings {
            idle_timeout: Duration::from_millis(
                self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            ),
            shutdown_timeout: Duration::from_millis(
                self.shutdown_timeout_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            ),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        };
        let spawn = SpawnSettings {
            startup_timeout: Duration::from_millis(
                self.startup_timeout_ms
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
            ),
            max_line_length: self.max_line_length.unwrap_or(DEFAULT_MAX_LINE_LENGTH).max(1),
            sigint_grace: Duration::from_millis(self.shutdown_sigint_ms.unwrap_or(DEFAULT_SIGINT_MS)),
            sigterm_grace: Duration::from_millis(
                self.shutdown_sigterm_ms.unwrap_or(DEFAULT_SIGTERM_MS),
            ),
        };

        let mut apps = Vec::with_capacity(self.apps.len());
        for entry in self.apps {
            if entry.subdomain.trim().is_empty() {
                bail!("app with cwd {} has an empty subdomain", entry.cwd);
            }
            if apps.iter().any(|app: &AppConfig| app.subdomain == entry.subdomain) {
                bail!("duplicate app subdomain: {}", entry.subdomain);
            }
            let cwd = Path::new(&entry.cwd);
            let cwd = if cwd.is_absolute() {
                cwd.to_path_buf()
            } else {
                base_dir.join(cwd)
            };
            apps.push(AppConfig {
                subdomain: entry.subdomain,
                cwd,
                script: entry.script.unwrap_or_else(|| DEFAULT_SCRIPT.to_string()),
                base_port: entry.port.unwrap_or(DEFAULT_PORT),
                install: entry.install,
                env: entry.env.unwrap_or_default(),
            });
        }

        Ok(Resolved {
            apps,
            runner,
            supervisor,
            spawn,
        })
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
