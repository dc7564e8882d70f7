use std::path::Path;

use custos_app::prelude::*;
use custos_config::{ConfigurationLoader, GenericConfiguration};
use custos_core::runtime::{BackoffConfig, RestartMode, RestartStrategy, RestartStrategyConfig, Supervisor};
use custos_error::{generic_error, ErrorContext as _, GenericError};
use custos_process::{OsProcessHandle, OsProcessSupervisor, WorkerSpec};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RunConfig;

/// Values used for any setting that neither the configuration file nor the environment provides.
#[derive(Serialize)]
struct TreeDefaults {
    supervisor_id: &'static str,
}

const TREE_DEFAULTS: TreeDefaults = TreeDefaults {
    supervisor_id: "root_sup",
};

/// Supervision tree configuration.
///
/// ```yaml
/// supervisor_id: root_sup
/// restart_strategy:
///   strategy: one_for_one
///   max_restarts: 5
///   max_time: 10000
/// backoff:
///   initial_backoff: 100
///   max_backoff: 5000
/// workers:
///   - name: counter
///     command: /usr/local/bin/custosd
///     args: [worker, --behavior, counter]
///     memory_limit: 500 MB
/// ```
#[derive(Deserialize)]
struct TreeConfiguration {
    supervisor_id: String,

    #[serde(default)]
    restart_strategy: Option<RestartStrategyConfig>,

    #[serde(default)]
    backoff: BackoffConfig,

    #[serde(default)]
    workers: Vec<WorkerSpec>,
}

fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let loader = ConfigurationLoader::default().with_defaults(TREE_DEFAULTS);
    let loader = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => loader.from_json(path)?,
        _ => loader.from_yaml(path)?,
    };

    Ok(loader.from_environment("CUSTOS")?.into_generic())
}

fn build_supervisor(tree: TreeConfiguration) -> Result<(Supervisor, Vec<OsProcessHandle>), GenericError> {
    let strategy = tree.restart_strategy.map(RestartStrategy::from).unwrap_or_default();
    if strategy.mode() == RestartMode::SimpleOneForOne {
        return Err(generic_error!(
            "Restart strategy 'simple_one_for_one' cannot be used for a statically configured supervision tree."
        ));
    }

    let mut supervisor = Supervisor::new(&tree.supervisor_id)?
        .with_restart_strategy(strategy)
        .with_backoff(tree.backoff);

    let mut handles = Vec::with_capacity(tree.workers.len());
    for spec in tree.workers {
        let name = spec.name.clone();
        let worker = OsProcessSupervisor::new(spec);
        handles.push(worker.handle());
        supervisor
            .add_child(worker.child_spec())
            .with_error_context(|| format!("Failed to add worker '{}'.", name))?;
    }

    Ok((supervisor, handles))
}

/// Entrypoint for the `run` subcommand.
pub async fn run(config: RunConfig) -> Result<(), GenericError> {
    let configuration = load_configuration(&config.config)
        .with_error_context(|| format!("Failed to load configuration from '{}'.", config.config.display()))?;

    let logging_config = LoggingConfiguration::from_configuration(&configuration)?;
    let _guard = initialize_logging(&logging_config)?;

    let tree = configuration
        .as_typed::<TreeConfiguration>()
        .error_context("Failed to load supervision tree configuration.")?;
    let (mut supervisor, handles) = build_supervisor(tree)?;

    info!(
        supervisor_id = supervisor.id(),
        workers = handles.len(),
        process_id = std::process::id(),
        "custosd starting..."
    );

    let result = supervisor
        .run_with_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt. Shutting down.");
            }
        })
        .await;

    for handle in &handles {
        info!(
            worker = handle.name(),
            recycles = handle.recycle_count(),
            "Worker stopped."
        );
    }

    result.error_context("Supervision tree failed.")
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use custos_core::runtime::RestartPolicy;

    use super::*;

    fn load(contents: &str, suffix: &str) -> Result<TreeConfiguration, GenericError> {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let config = load_configuration(file.path())?;
        Ok(config.as_typed()?)
    }

    #[test]
    fn builds_tree_from_yaml() {
        let tree = load(
            r#"
supervisor_id: pool_sup
restart_strategy:
  strategy: one_for_all
  max_restarts: 5
  max_time: 10000
workers:
  - name: counter
    command: /usr/local/bin/custosd
    args: [worker, --behavior, counter]
  - name: echo
    command: /usr/local/bin/custosd
    args: [worker, --behavior, echo]
    restart_policy: transient
"#,
            ".yaml",
        )
        .unwrap();

        let (supervisor, handles) = build_supervisor(tree).unwrap();
        assert_eq!(supervisor.id(), "pool_sup");
        assert_eq!(handles.len(), 2);

        let children = supervisor.handle().children();
        let ids = children.iter().map(|child| child.id()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["counter", "echo"]);
        assert_eq!(children[1].restart_policy(), RestartPolicy::Transient);
    }

    #[test]
    fn builds_tree_from_json() {
        let tree = load(
            r#"{"workers": [{"name": "echo", "command": "custosd", "args": ["worker", "-b", "echo"]}]}"#,
            ".json",
        )
        .unwrap();

        // Filled in from the loader defaults.
        let (supervisor, handles) = build_supervisor(tree).unwrap();
        assert_eq!(supervisor.id(), "root_sup");
        assert_eq!(handles[0].name(), "echo");
    }

    #[test]
    fn rejects_invalid_trees() {
        let tree = load(
            "restart_strategy:\n  strategy: simple_one_for_one\nworkers: []\n",
            ".yaml",
        )
        .unwrap();
        assert!(build_supervisor(tree).is_err());

        let tree = load(
            "workers:\n  - name: twin\n    command: a\n  - name: twin\n    command: b\n",
            ".yaml",
        )
        .unwrap();
        assert!(build_supervisor(tree).is_err());
    }
}
