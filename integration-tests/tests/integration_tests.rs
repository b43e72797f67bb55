// Integration tests: ledger → sync cycle → bucket store → bucket execution

use async_trait::async_trait;
use common::context::AppContext;
use common::errors::PackageError;
use common::executor::ExecutionAggregator;
use common::ledger::{InMemoryLedger, JobLedger, SyncMode};
use common::models::{BucketKey, JobRecord, ScheduleSpec};
use common::packages::{CommandPackageManager, DependencyResolver, PackageManager};
use common::sandbox::{Sandbox, SandboxConfig};
use common::sync::SyncCoordinator;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Package manager backed by an in-test registry of module sources
struct RegistryManager {
    module_dir: PathBuf,
    registry: HashMap<String, String>,
}

#[async_trait]
impl PackageManager for RegistryManager {
    async fn install(&self, packages: &[String]) -> Result<String, PackageError> {
        let mut log = String::new();
        for package in packages {
            match self.registry.get(package) {
                Some(source) => {
                    std::fs::write(self.module_dir.join(format!("{}.rhai", package)), source)
                        .map_err(|e| PackageError::NonZeroExit {
                            code: Some(1),
                            output: e.to_string(),
                        })?;
                    log.push_str(&format!("Installed {}\n", package));
                }
                None => {
                    return Err(PackageError::NonZeroExit {
                        code: Some(1),
                        output: format!("No matching distribution found for {}", package),
                    })
                }
            }
        }
        Ok(log)
    }

    async fn list_installed(&self) -> Result<String, PackageError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.module_dir).map_err(|e| PackageError::Spawn {
            command: "list".to_string(),
            reason: e.to_string(),
        })? {
            let path = entry
                .map_err(|e| PackageError::Spawn {
                    command: "list".to_string(),
                    reason: e.to_string(),
                })?
                .path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        Ok(names.join("\n"))
    }
}

struct System {
    _modules: TempDir,
    ledger: Arc<InMemoryLedger>,
    coordinator: SyncCoordinator,
    aggregator: ExecutionAggregator,
}

fn sandbox_for(module_dir: &Path) -> Arc<Sandbox> {
    Arc::new(Sandbox::new(SandboxConfig {
        module_dir: module_dir.to_path_buf(),
        timeout: Some(Duration::from_secs(5)),
        max_operations: 0,
    }))
}

fn system_with(modules: TempDir, manager: Arc<dyn PackageManager>) -> System {
    let ledger = Arc::new(InMemoryLedger::new());
    let sandbox = sandbox_for(modules.path());
    let context = Arc::new(AppContext::new());

    let coordinator = SyncCoordinator::new(
        ledger.clone(),
        DependencyResolver::new(manager, Duration::ZERO),
        sandbox.clone(),
        context.clone(),
    );
    let aggregator = ExecutionAggregator::new(sandbox, context, 5);

    System {
        _modules: modules,
        ledger,
        coordinator,
        aggregator,
    }
}

fn system() -> System {
    let modules = tempfile::tempdir().unwrap();
    let mut registry = HashMap::new();
    registry.insert("flask".to_string(), "fn route(path) { `route ${path}` }".to_string());
    let manager = Arc::new(RegistryManager {
        module_dir: modules.path().to_path_buf(),
        registry,
    });
    system_with(modules, manager)
}

fn hour(value: &str) -> ScheduleSpec {
    ScheduleSpec::new().with("hour", value)
}

#[tokio::test]
async fn test_synced_record_runs_from_its_bucket() {
    let sys = system();
    let record = JobRecord::new(hour("11"), vec!["flask".to_string()], "print('x')").unwrap();
    sys.ledger.insert(&record).await.unwrap();

    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();

    let key = BucketKey::from_spec(&hour("11"));
    assert_eq!(sys.coordinator.context().store.len(&key).await, 1);

    let results = sys.aggregator.run(&key).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[&record.id], "x\n");
}

#[tokio::test]
async fn test_installed_package_is_importable() {
    let sys = system();
    let record = JobRecord::new(
        hour("11"),
        vec!["flask".to_string()],
        "import \"flask\" as flask;\nprint(flask::route(\"/\"));",
    )
    .unwrap();
    sys.ledger.insert(&record).await.unwrap();

    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();
    assert!(sys
        .coordinator
        .context()
        .dependencies
        .snapshot()
        .await
        .contains("flask"));

    let results = sys.aggregator.run(&record.bucket_key()).await;
    assert_eq!(results[&record.id], "route /\n");
}

#[tokio::test]
async fn test_division_by_zero_is_contained_per_job() {
    let sys = system();
    let faulty = JobRecord::new(hour("11"), vec![], "print(1/0)").unwrap();
    let sibling = JobRecord::new(hour("11"), vec![], "print(\"still here\")").unwrap();
    sys.ledger.insert(&faulty).await.unwrap();
    sys.ledger.insert(&sibling).await.unwrap();

    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();
    let results = sys.aggregator.run(&faulty.bucket_key()).await;

    assert!(results[&faulty.id].to_lowercase().contains("division by zero"));
    assert_eq!(results[&sibling.id], "still here\n");
}

#[tokio::test]
async fn test_uninstallable_dependency_still_materializes() {
    let sys = system();
    let record = JobRecord::new(
        hour("11"),
        vec!["no-such-package".to_string()],
        "import \"no-such-package\" as p;\nprint(p::thing);",
    )
    .unwrap();
    sys.ledger.insert(&record).await.unwrap();

    let report = sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();
    assert!(report.install_failed);
    assert_eq!(sys.coordinator.context().store.len(&record.bucket_key()).await, 1);

    let results = sys.aggregator.run(&record.bucket_key()).await;
    let text = &results[&record.id];
    assert!(text.contains("not found"), "unexpected result: {}", text);
    assert!(text.contains("no-such-package"));
}

#[tokio::test]
async fn test_deleted_record_is_excluded_from_later_runs() {
    let sys = system();
    let keep = JobRecord::new(hour("11"), vec![], "print(\"keep\")").unwrap();
    let doomed = JobRecord::new(hour("11"), vec![], "print(\"doomed\")").unwrap();
    sys.ledger.insert(&keep).await.unwrap();
    sys.ledger.insert(&doomed).await.unwrap();
    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();

    sys.ledger.mark_for_deletion(doomed.id).await.unwrap();
    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();

    assert!(sys.ledger.get(doomed.id).await.unwrap().is_none());
    let results = sys.aggregator.run(&keep.bucket_key()).await;
    assert_eq!(results.len(), 1);
    assert!(!results.contains_key(&doomed.id));
    assert_eq!(results[&keep.id], "keep\n");
}

#[tokio::test]
async fn test_syntax_error_surfaces_as_result_text() {
    let sys = system();
    let record = JobRecord::new(hour("11"), vec![], "print(\"unterminated").unwrap();
    sys.ledger.insert(&record).await.unwrap();

    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();
    let results = sys.aggregator.run(&record.bucket_key()).await;

    let text = &results[&record.id];
    assert!(!text.trim().is_empty());
    assert!(text.ends_with('\n'));
}

#[tokio::test]
async fn test_full_resync_duplicates_synced_units() {
    let sys = system();
    let record = JobRecord::new(hour("11"), vec![], "print(1)").unwrap();
    sys.ledger.insert(&record).await.unwrap();

    sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();
    sys.coordinator.cycle(SyncMode::Full).await.unwrap();

    assert_eq!(sys.coordinator.context().store.len(&record.bucket_key()).await, 2);
}

#[tokio::test]
async fn test_packages_script_installs_from_registry() {
    let modules = tempfile::tempdir().unwrap();
    let registry = tempfile::tempdir().unwrap();
    std::fs::write(
        registry.path().join("greeting.rhai"),
        "fn hello(name) { `Hello, ${name}!` }",
    )
    .unwrap();

    let script = concat!(env!("CARGO_MANIFEST_DIR"), "/../tools/packages.sh");
    let command = |action: &str| -> Vec<String> {
        vec![
            "env".to_string(),
            format!("PACKAGE_REGISTRY={}", registry.path().display()),
            format!("MODULE_DIR={}", modules.path().display()),
            "sh".to_string(),
            script.to_string(),
            action.to_string(),
        ]
    };
    let manager = CommandPackageManager::new(command("install"), command("list")).unwrap();
    let sys = system_with(modules, Arc::new(manager));

    let record = JobRecord::new(
        hour("7"),
        vec!["greeting==1.0".to_string()],
        "import \"greeting\" as g;\nprint(g::hello(\"cron\"));",
    )
    .unwrap();
    sys.ledger.insert(&record).await.unwrap();

    let report = sys.coordinator.cycle(SyncMode::Incremental).await.unwrap();
    assert!(!report.install_failed);

    let results = sys.aggregator.run(&record.bucket_key()).await;
    assert_eq!(results[&record.id], "Hello, cron!\n");
}
