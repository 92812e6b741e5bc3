mod mock_device;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use fwconductor::app::run::{generate_plans, run_plan};
use fwconductor::app::{AppOptions, AppState};
use fwconductor::authn::StaticCredentials;
use fwconductor::jobs::{job_types, JobStatus};
use fwconductor::planner::models::{GroupKind, PlanGroup};
use fwconductor::planner::{
    Criticality, DeviceRecord, FirmwarePackage, Inventory, OrchestrationPlan, PlanKind,
    PlanStatus, StaticInventory,
};
use fwconductor::redfish::DeviceCredentials;
use fwconductor::store::{MemoryStore, RecordStore};
use fwconductor::workflow::{ExecutionStatus, StepKind, WorkflowStep, WorkflowTemplate};

use mock_device::{fast_options, DeviceConfig, MockDevice, SIMPLE_UPDATE_PATH};

fn device(id: &str, address: &str, cluster: Option<&str>, env: &str) -> DeviceRecord {
    DeviceRecord {
        id: id.to_string(),
        name: id.to_uppercase(),
        address: address.to_string(),
        model: Some("R750".to_string()),
        cluster: cluster.map(str::to_string),
        environment: Some(env.to_string()),
        last_update: None,
        service_tag: None,
        health: Default::default(),
    }
}

fn bios_package() -> FirmwarePackage {
    FirmwarePackage {
        id: "bios-2.19".to_string(),
        name: "BIOS".to_string(),
        version: "2.19.1".to_string(),
        image_uri: "https://repo.example.com/BIOS_2.19.1.EXE".to_string(),
        criticality: Criticality::Critical,
        sequence_order: 1,
        compatible_models: vec!["R750".to_string()],
        rollback_image_uri: Some("https://repo.example.com/BIOS_2.18.0.EXE".to_string()),
    }
}

fn options() -> AppOptions {
    let mut options = AppOptions::default();
    options.redfish = fast_options();
    options.dispatcher.interval = Duration::from_millis(20);
    options.dispatcher.job_timeout = Duration::from_secs(5);
    options.dispatcher.ready_timeout = Duration::from_secs(5);
    options.dispatcher.connectivity_timeout = Duration::from_secs(5);
    options
}

fn app_state(inventory: Inventory) -> (Arc<MemoryStore>, Arc<AppState>) {
    let store = Arc::new(MemoryStore::new());
    let credentials = StaticCredentials::new(Some(DeviceCredentials::new("root", "calvin")));
    let state = AppState::with_store(
        &options(),
        store.clone(),
        Arc::new(credentials),
        Arc::new(StaticInventory::new(inventory)),
    );
    (store, Arc::new(state))
}

fn manual_plan(id: &str, device_ids: &[&str]) -> OrchestrationPlan {
    let now = Utc::now();
    OrchestrationPlan {
        id: id.to_string(),
        name: "Operator maintenance".to_string(),
        kind: PlanKind::Manual,
        status: PlanStatus::Active,
        group: PlanGroup {
            name: "manual".to_string(),
            kind: GroupKind::Standalone,
            environment: None,
        },
        device_ids: device_ids.iter().map(|d| d.to_string()).collect(),
        workflow: WorkflowTemplate {
            id: format!("plan-{}", id),
            name: "manual".to_string(),
            description: None,
            steps: vec![WorkflowStep::new("wait", StepKind::Delay { duration_ms: 1 })],
        },
        safety_checks: Vec::new(),
        rollback_steps: Vec::new(),
        next_execution_date: now,
        recurrence_interval_secs: 0,
        created_at: now,
    }
}

#[tokio::test]
async fn test_plans_ordered_by_environment_priority() {
    let mut recent = device("recent", "10.0.0.9", None, "staging");
    recent.last_update = Some(Utc::now() - chrono::Duration::days(2));

    let inventory = Inventory {
        devices: vec![
            device("dev1", "10.0.0.1", None, "dev"),
            device("db1", "10.0.0.2", Some("db"), "prod"),
            device("db2", "10.0.0.3", Some("db"), "prod"),
            recent,
        ],
        packages: vec![bios_package()],
    };
    let (store, state) = app_state(inventory);

    let plans = generate_plans(&state).await.unwrap();

    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].group.environment.as_deref(), Some("prod"));
    assert_eq!(plans[0].group.kind, GroupKind::Cluster);
    assert_eq!(plans[0].device_ids, vec!["db1", "db2"]);
    assert_eq!(plans[1].group.environment.as_deref(), Some("dev"));
    assert_eq!(
        plans[1].next_execution_date - plans[0].next_execution_date,
        chrono::Duration::hours(1)
    );

    assert_eq!(store.list_plans().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_manual_plan_overwritten_with_audit_event() {
    let inventory = Inventory {
        devices: vec![device("web1", "10.0.0.1", None, "prod")],
        packages: vec![bios_package()],
    };
    let (store, state) = app_state(inventory);
    store
        .save_plan(&manual_plan("manual-1", &["web1"]))
        .await
        .unwrap();
    store
        .save_plan(&manual_plan("manual-2", &["other"]))
        .await
        .unwrap();

    let plans = generate_plans(&state).await.unwrap();
    assert_eq!(plans.len(), 1);

    let overwritten = store.get_plan("manual-1").await.unwrap().unwrap();
    assert_eq!(overwritten.status, PlanStatus::Overwritten);
    let untouched = store.get_plan("manual-2").await.unwrap().unwrap();
    assert_eq!(untouched.status, PlanStatus::Active);

    let audit = store.list_audit().await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "plan_overwritten");
    assert_eq!(audit[0].plan_ids, vec!["manual-1".to_string(), plans[0].id.clone()]);
}

#[tokio::test]
async fn test_plan_run_updates_device() {
    let device_mock = MockDevice::start(DeviceConfig::default()).await;
    let inventory = Inventory {
        devices: vec![device("web1", &device_mock.base_url(), None, "prod")],
        packages: vec![bios_package()],
    };
    let (store, state) = app_state(inventory);
    let plan = generate_plans(&state).await.unwrap().remove(0);

    let outcome = run_plan(state, &plan.id, false).await.unwrap();

    assert_eq!(outcome.execution.status, ExecutionStatus::Completed);
    assert_eq!(outcome.jobs.len(), 4);
    assert!(outcome
        .jobs
        .iter()
        .all(|job| job.status == JobStatus::Completed));

    let posted = device_mock.state.requests_to(SIMPLE_UPDATE_PATH);
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].json()["ImageURI"], "https://repo.example.com/BIOS_2.19.1.EXE");

    let stored = store.get_execution(&outcome.execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert_eq!(stored.job_ids.len(), 4);
}

#[tokio::test]
async fn test_failed_safety_check_cancels_updates() {
    let device_mock = MockDevice::start(DeviceConfig::default()).await;
    let mut web1 = device("web1", &device_mock.base_url(), None, "prod");
    web1.health.insert("disk_space".to_string(), false);
    let inventory = Inventory {
        devices: vec![web1],
        packages: vec![bios_package()],
    };
    let (_store, state) = app_state(inventory);
    let plan = generate_plans(&state).await.unwrap().remove(0);

    let outcome = run_plan(state, &plan.id, false).await.unwrap();

    let status_of = |check: &str| {
        outcome
            .jobs
            .iter()
            .find(|job| job.metadata["check"] == check)
            .map(|job| job.status)
    };
    assert_eq!(status_of("connectivity"), Some(JobStatus::Completed));
    assert_eq!(status_of("disk_space"), Some(JobStatus::Failed));
    assert_eq!(status_of("backup_verification"), Some(JobStatus::Cancelled));

    let update = outcome
        .jobs
        .iter()
        .find(|job| job.job_type == job_types::FIRMWARE_UPDATE)
        .unwrap();
    assert_eq!(update.status, JobStatus::Cancelled);
    assert!(device_mock.state.requests_to(SIMPLE_UPDATE_PATH).is_empty());
}

#[tokio::test]
async fn test_rollback_run_applies_previous_images() {
    let device_mock = MockDevice::start(DeviceConfig::default()).await;
    let inventory = Inventory {
        devices: vec![device("web1", &device_mock.base_url(), None, "prod")],
        packages: vec![bios_package()],
    };
    let (_store, state) = app_state(inventory);
    let plan = generate_plans(&state).await.unwrap().remove(0);

    let outcome = run_plan(state, &plan.id, true).await.unwrap();

    assert_eq!(outcome.jobs.len(), 1);
    assert_eq!(outcome.jobs[0].job_type, job_types::ROLLBACK);
    assert_eq!(outcome.jobs[0].status, JobStatus::Completed);

    let posted = device_mock.state.requests_to(SIMPLE_UPDATE_PATH);
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].json()["ImageURI"], "https://repo.example.com/BIOS_2.18.0.EXE");
}

#[tokio::test]
async fn test_unknown_plan_is_not_found() {
    let (_store, state) = app_state(Inventory::default());
    let err = run_plan(state, "missing", false).await.unwrap_err();
    assert!(err.to_string().contains("missing"));
}
