//! Runs detectors in real `detector-host child` processes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use child_process::{ChildProcessError, ChildProcessManager, FailureKind};
use detector_host::config::HostConfig;
use detector_host::domain::{
    AnalysisRequest, ResolutionCheckRequest, ResourceIdentifier, ResourceType, TimeRange,
};
use detector_host::scheduler::{ChildProcessRuleExecutor, RuleExecutor};
use detector_package::{MANIFEST_FILE, create_package};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

const HOST: &str = env!("CARGO_BIN_EXE_detector-host");

fn executor(packages_dir: &Path) -> ChildProcessRuleExecutor {
    let config = HostConfig {
        packages_dir: packages_dir.to_path_buf(),
        grace_period: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_secs(5),
        start_timeout: Duration::from_secs(10),
        max_run_time: Some(Duration::from_secs(30)),
        exit_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let manager = ChildProcessManager::new(config.child_process_config(Path::new(HOST))).unwrap();
    ChildProcessRuleExecutor::new(manager)
}

fn analysis(detector_id: &str, resources: &[ResourceIdentifier], settings: Value) -> AnalysisRequest {
    let now = Utc::now();
    AnalysisRequest {
        detector_id: detector_id.to_string(),
        target_resources: resources.iter().cloned().collect::<BTreeSet<_>>(),
        time_range: TimeRange::new(now - chrono::Duration::hours(1), now).unwrap(),
        settings: settings.as_object().cloned().unwrap_or_default(),
    }
}

fn vm(name: &str) -> ResourceIdentifier {
    ResourceIdentifier::resource(ResourceType::VirtualMachine, "sub-1", "rg-prod", name)
}

fn write_package(root: &Path, id: &str, manifest: Value) -> PathBuf {
    let src = root.join("src").join(id);
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join(MANIFEST_FILE), manifest.to_string()).unwrap();
    let packages = root.join("packages");
    create_package(&src, id, &packages).unwrap();
    packages
}

fn failure_kind(err: &ChildProcessError) -> Option<FailureKind> {
    match err {
        ChildProcessError::ChildFailure(failure) => Some(failure.kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_builtin_detector_in_child() {
    let dir = tempfile::tempdir().unwrap();
    let resources = [
        ResourceIdentifier::resource_group("sub-1", "rg-a"),
        ResourceIdentifier::resource_group("sub-1", "rg-b"),
    ];

    let alerts = executor(dir.path())
        .execute(
            analysis("resource-inventory", &resources, json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].resource, resources[0]);
    assert_eq!(alerts[1].title, format!("Inventory: {}", resources[1]));
}

#[tokio::test]
async fn test_packaged_detector_with_rule_settings() {
    let dir = tempfile::tempdir().unwrap();
    let packages = write_package(
        dir.path(),
        "cpu-high",
        json!({
            "id": "cpu-high",
            "version": "1.2.0",
            "variant": "threshold",
            "settings": {"threshold": 90, "severity": "high"}
        }),
    );

    let request = analysis(
        "cpu-high",
        &[vm("vm-01"), vm("vm-02")],
        json!({"threshold": 75, "values": {"vm-01": 80.5, "vm-02": 12}}),
    );
    let alerts = executor(&packages)
        .execute(request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].resource, vm("vm-01"));
    assert_eq!(alerts[0].properties["threshold"], 75.0);
}

#[tokio::test]
async fn test_unknown_detector_fails_with_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path())
        .execute(analysis("no-such-detector", &[], json!({})), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure_kind(&err), Some(FailureKind::NotFound));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn test_incompatible_resource_fails_in_child() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path())
        .execute(
            analysis("threshold", &[ResourceIdentifier::subscription("sub-1")], json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(failure_kind(&err), Some(FailureKind::Incompatible));
}

#[tokio::test]
async fn test_transient_failure_is_retriable_across_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let err = executor(dir.path())
        .execute(
            analysis("threshold", &[vm("vm-01")], json!({"threshold": 50})),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(failure_kind(&err), Some(FailureKind::TransientDependency));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_corrupt_package_is_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.package"), b"definitely not a zip").unwrap();

    let err = executor(dir.path())
        .execute(analysis("broken", &[], json!({})), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure_kind(&err), Some(FailureKind::LoadFailure));
}

#[tokio::test]
async fn test_resolution_check_in_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Map::new();
    settings.insert("threshold".to_string(), json!(80));
    settings.insert("values".to_string(), json!({"vm-01": 95}));

    let state = executor(dir.path())
        .check_resolution(
            ResolutionCheckRequest {
                detector_id: "threshold".to_string(),
                resource: vm("vm-01"),
                alert_properties: Map::new(),
                settings,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!state.is_resolved);
    assert_eq!(state.properties["value"], 95.0);
}

#[tokio::test]
async fn test_cancel_before_start_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = executor(dir.path())
        .execute(analysis("noop", &[], json!({})), cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
}
