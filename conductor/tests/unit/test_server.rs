use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use control_api::{ExecutionControlResponse, HealthResponse, PlanListResponse};
use fwconductor::jobs::{JobQueue, JobStatus, MemoryJobQueue};
use fwconductor::planner::{
    Criticality, DeviceRecord, FirmwarePackage, Inventory, PlanGenerator, PlannerOptions,
};
use fwconductor::server::{router, ServerState};
use fwconductor::store::MemoryStore;
use fwconductor::workflow::{StepKind, WorkflowEngine, WorkflowStep, WorkflowTemplate};

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryJobQueue>,
    engine: Arc<WorkflowEngine>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let engine = Arc::new(WorkflowEngine::new(queue.clone(), store.clone()));
    let app = router(Arc::new(ServerState::new(engine.clone(), store.clone())));
    Harness {
        app,
        store,
        queue,
        engine,
    }
}

async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

/// A device job, then a delay long enough to cancel during
fn slow_template() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "maintenance".to_string(),
        name: "Maintenance".to_string(),
        description: None,
        steps: vec![
            WorkflowStep::new(
                "update",
                StepKind::Job {
                    job_type: "firmware_update".to_string(),
                    device_id: Some("web1".to_string()),
                    metadata: json!({}),
                },
            )
            .then("settle"),
            WorkflowStep::new("settle", StepKind::Delay { duration_ms: 60_000 }).then("verify"),
            WorkflowStep::new(
                "verify",
                StepKind::Job {
                    job_type: "firmware_update".to_string(),
                    device_id: Some("web1".to_string()),
                    metadata: json!({}),
                },
            ),
        ],
    }
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = call(&h.app, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.service, "fwconductor");
}

#[tokio::test]
async fn test_plans_listing() {
    let h = harness();
    let generator = PlanGenerator::new(PlannerOptions::default(), h.store.clone());
    let inventory = Inventory {
        devices: vec![DeviceRecord {
            id: "web1".to_string(),
            name: "WEB1".to_string(),
            address: "10.0.0.1".to_string(),
            model: None,
            cluster: None,
            environment: Some("prod".to_string()),
            last_update: None,
            service_tag: None,
            health: Default::default(),
        }],
        packages: vec![FirmwarePackage {
            id: "idrac".to_string(),
            name: "iDRAC".to_string(),
            version: "7.10".to_string(),
            image_uri: "https://repo.example.com/iDRAC_7.10.EXE".to_string(),
            criticality: Criticality::Important,
            sequence_order: 1,
            compatible_models: vec![],
            rollback_image_uri: None,
        }],
    };
    generator
        .generate_and_install(&inventory, chrono::Utc::now())
        .await
        .unwrap();

    let (status, body) = call(&h.app, Method::GET, "/plans").await;
    assert_eq!(status, StatusCode::OK);

    let listing: PlanListResponse = serde_json::from_value(body).unwrap();
    assert_eq!(listing.total, 1);
    assert_eq!(listing.plans[0].kind, "auto");
    assert_eq!(listing.plans[0].status, "active");
    assert_eq!(listing.plans[0].group, "web1");
    assert_eq!(listing.plans[0].device_count, 1);
}

#[tokio::test]
async fn test_execution_lookup_and_cancel() {
    let h = harness();
    let id = h
        .engine
        .launch(&slow_template(), json!({"plan_id": "p1"}))
        .await
        .unwrap();

    // wait for the first job to be submitted
    for _ in 0..100 {
        if !h.queue.jobs_for_run(&id).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let (status, body) = call(&h.app, Method::GET, &format!("/executions/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["context"]["plan_id"], "p1");

    let (status, body) = call(&h.app, Method::POST, &format!("/executions/{}/cancel", id)).await;
    assert_eq!(status, StatusCode::OK);
    let control: ExecutionControlResponse = serde_json::from_value(body).unwrap();
    assert!(control.success);
    assert_eq!(control.status, "cancelled");

    let jobs = h.queue.jobs_for_run(&id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Cancelled);

    let (status, _) = call(&h.app, Method::POST, &format!("/executions/{}/cancel", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_execution_is_404() {
    let h = harness();

    let (status, body) = call(&h.app, Method::GET, "/executions/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = call(&h.app, Method::POST, "/executions/nope/cancel").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
