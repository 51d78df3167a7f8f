//! One runtime supervisor per app, keyed by subdomain.
//!
//! Supervisors are created lazily the first time an app is asked for and torn
//! down when the app is removed.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::config::{AppConfig, ScriptRunner, SupervisorSettings};
use crate::supervisor::{Collaborators, RuntimeHandle};

pub struct Registry {
    apps: BTreeMap<String, AppConfig>,
    running: BTreeMap<String, RuntimeHandle>,
    runner: ScriptRunner,
    settings: SupervisorSettings,
    collaborators: Collaborators,
}

impl Registry {
    pub fn new(
        apps: Vec<AppConfig>,
        runner: ScriptRunner,
        settings: SupervisorSettings,
        collaborators: Collaborators,
    ) -> Self {
        let apps = apps
            .into_iter()
            .map(|app| (app.subdomain.clone(), app))
            .collect();
        Self {
            apps,
            running: BTreeMap::new(),
            runner,
            settings,
            collaborators,
        }
    }

    /// Subdomains of every configured app, sorted.
    pub fn subdomains(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }

    /// Handles of supervisors that are currently alive, sorted by subdomain.
    pub fn running(&self) -> impl Iterator<Item = &RuntimeHandle> {
        self.running.values()
    }

    pub fn get(&self, subdomain: &str) -> Option<&RuntimeHandle> {
        self.running.get(subdomain)
    }

    /// Returns the supervisor for `subdomain`, starting one if needed.
    pub fn get_or_start(&mut self, subdomain: &str) -> Result<RuntimeHandle> {
        if let Some(handle) = self.running.get(subdomain) {
            return Ok(handle.clone());
        }
        let app = self
            .apps
            .get(subdomain)
            .cloned()
            .ok_or_else(|| anyhow!("unknown app: {}", subdomain))?;
        info!(subdomain, "starting supervisor");
        let handle = RuntimeHandle::start(
            app,
            self.runner.clone(),
            self.settings,
            self.collaborators.clone(),
        );
        self.running.insert(subdomain.to_string(), handle.clone());
        Ok(handle)
    }

    /// Shuts down and forgets the supervisor for `subdomain`.
    ///
    /// Returns `false` if none was running.
    pub async fn remove(&mut self, subdomain: &str) -> bool {
        let Some(handle) = self.running.remove(subdomain) else {
            return false;
        };
        info!(subdomain, "removing supervisor");
        // Already gone is as good as shut down.
        let _ = handle.shutdown().await;
        true
    }

    pub async fn shutdown_all(&mut self) {
        let subdomains: Vec<String> = self.running.keys().cloned().collect();
        for subdomain in subdomains {
            self.remove(&subdomain).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::diagnostics::TracingDiagnostics;
    use crate::publisher::Publisher;
    use crate::spawn::{SpawnInput, Spawner};

    #[derive(Default)]
    struct CountingSpawner {
        inputs: Mutex<Vec<String>>,
    }

    impl Spawner for CountingSpawner {
        fn spawn(&self, input: SpawnInput) {
            if let Ok(mut inputs) = self.inputs.lock() {
                inputs.push(input.app.subdomain);
            }
        }
    }

    fn app(subdomain: &str) -> AppConfig {
        AppConfig {
            subdomain: subdomain.to_string(),
            cwd: PathBuf::from("/tmp").join(subdomain),
            script: "dev".to_string(),
            base_port: 3000,
            install: None,
            env: HashMap::new(),
        }
    }

    fn registry(spawner: Arc<CountingSpawner>) -> Registry {
        Registry::new(
            vec![app("shop"), app("blog")],
            ScriptRunner::parse("npm run").unwrap(),
            SupervisorSettings::default(),
            Collaborators {
                spawner,
                publisher: Publisher::new(16),
                diagnostics: Arc::new(TracingDiagnostics),
            },
        )
    }

    #[tokio::test]
    async fn starts_lazily_and_once() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut registry = registry(spawner.clone());
        assert_eq!(registry.subdomains(), vec!["blog", "shop"]);
        assert!(registry.get("blog").is_none());

        let first = registry.get_or_start("blog").unwrap();
        let again = registry.get_or_start("blog").unwrap();
        assert_eq!(first.subdomain(), again.subdomain());
        first.snapshot().await.unwrap();
        assert_eq!(*spawner.inputs.lock().unwrap(), vec!["blog".to_string()]);
        assert_eq!(registry.running().count(), 1);

        assert!(registry.get_or_start("missing").is_err());
    }

    #[tokio::test]
    async fn remove_shuts_supervisor_down() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut registry = registry(spawner);
        let handle = registry.get_or_start("shop").unwrap();
        registry.get_or_start("blog").unwrap();

        assert!(registry.remove("shop").await);
        assert!(!registry.remove("shop").await);
        assert!(handle.restart().await.is_err());

        registry.shutdown_all().await;
        assert_eq!(registry.running().count(), 0);
    }
}
