mod mock_device;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use fwconductor::errors::ProtocolError;
use fwconductor::redfish::{AuthMode, ClientPool, RedfishClient, UpdateRequest, UpdateSpec};
use fwconductor::transport::ClientFactory;

use mock_device::{
    fast_options, DeviceConfig, MockDevice, PayloadServer, PUSH_PATH, REPOSITORY_PATH,
    SIMPLE_UPDATE_PATH, TASK_PATH,
};

const UPDATE_SERVICE_PATH: &str = "/redfish/v1/UpdateService";
const FIRMWARE: &[u8] = b"FIRMWARE-IMAGE-BYTES-0123456789";

fn connect(device: &MockDevice) -> RedfishClient {
    RedfishClient::connect(&ClientFactory::new(), device.target(), fast_options()).unwrap()
}

fn deadline(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

#[tokio::test]
async fn test_simple_update_posts_to_advertised_target() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let client = connect(&device);

    let request = UpdateRequest::new(
        device.target(),
        UpdateSpec::direct_uri("https://cdn.example.com/fw/BIOS_2.1.EXE"),
    );
    let outcome = client.submit_update(&request).await.unwrap();

    assert_eq!(outcome.status, 202);
    assert_eq!(outcome.task_location, Some(client.url(TASK_PATH).unwrap()));

    let posted = device.state.requests_to(SIMPLE_UPDATE_PATH);
    assert_eq!(posted.len(), 1);
    let body = posted[0].json();
    assert_eq!(body["ImageURI"], "https://cdn.example.com/fw/BIOS_2.1.EXE");
    assert_eq!(body["TransferProtocol"], "HTTPS");
    assert_eq!(posted[0].token.as_deref(), Some("token-1"));
}

#[tokio::test]
async fn test_update_without_location_has_no_task() {
    let device = MockDevice::start(DeviceConfig {
        update_location: None,
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let request = UpdateRequest::new(device.target(), UpdateSpec::direct_uri("http://repo/fw.bin"));
    let outcome = client.submit_update(&request).await.unwrap();

    assert_eq!(outcome.status, 200);
    assert!(outcome.task_location.is_none());
    assert_eq!(
        device.state.requests_to(SIMPLE_UPDATE_PATH)[0].json()["TransferProtocol"],
        "HTTP"
    );
}

#[tokio::test]
async fn test_empty_image_uri_is_rejected_locally() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let client = connect(&device);

    let request = UpdateRequest::new(device.target(), UpdateSpec::direct_uri("  "));
    let err = client.submit_update(&request).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Validation(_)));
    assert!(device.state.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_repository_install_uses_vendor_action() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let client = connect(&device);

    let request = UpdateRequest::new(
        device.target(),
        UpdateSpec::repository_install(Some("http://repo.local/catalog/Catalog.xml".to_string())),
    );
    client.submit_update(&request).await.unwrap();

    let posted = device.state.requests_to(REPOSITORY_PATH);
    assert_eq!(posted.len(), 1);
    let body = posted[0].json();
    assert_eq!(body["IPAddress"], "repo.local");
    assert_eq!(body["ShareType"], "HTTP");
    assert_eq!(body["ShareName"], "catalog");
    assert_eq!(body["CatalogFile"], "Catalog.xml");
}

#[tokio::test]
async fn test_multipart_upload_sends_file_and_parameters() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let client = connect(&device);

    let mut image = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
    image.write_all(b"FIRMWARE-IMAGE-BYTES").unwrap();
    let path = image.path().to_string_lossy().to_string();

    let request = UpdateRequest::new(device.target(), UpdateSpec::multipart_upload(path));
    let outcome = client.submit_update(&request).await.unwrap();
    assert!(outcome.task_location.is_some());

    let posted = device.state.requests_to(PUSH_PATH);
    assert_eq!(posted.len(), 1);
    let text = posted[0].text();
    assert!(text.contains("name=\"UpdateParameters\""));
    assert!(text.contains("name=\"UpdateFile\""));
    assert!(text.contains("FIRMWARE-IMAGE-BYTES"));
}

#[tokio::test]
async fn test_multipart_upload_follows_payload_redirect() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let payload = PayloadServer::start(FIRMWARE.to_vec()).await;
    let client = connect(&device);

    let request = UpdateRequest::new(
        device.target(),
        UpdateSpec::multipart_upload(payload.url("/redirect/fw.bin")),
    );
    let outcome = client.submit_update(&request).await.unwrap();
    assert_eq!(outcome.task_location, Some(client.url(TASK_PATH).unwrap()));

    assert_eq!(payload.state.fetches_of("/redirect/fw.bin"), 1);
    assert_eq!(payload.state.fetches_of("/files/fw.bin"), 1);

    let posted = device.state.requests_to(PUSH_PATH);
    assert_eq!(posted.len(), 1);
    let text = posted[0].text();
    assert!(text.contains("filename=\"fw.bin\""));
    assert!(text.contains(std::str::from_utf8(FIRMWARE).unwrap()));
}

#[tokio::test]
async fn test_unknown_size_payload_is_buffered_with_length() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let payload = PayloadServer::start(FIRMWARE.to_vec()).await;
    let client = connect(&device);

    let request = UpdateRequest::new(
        device.target(),
        UpdateSpec::multipart_upload(payload.url("/chunked/fw.bin")),
    );
    client.submit_update(&request).await.unwrap();

    assert_eq!(payload.state.fetches_of("/chunked/fw.bin"), 1);
    let posted = device.state.requests_to(PUSH_PATH);
    assert_eq!(posted.len(), 1);
    let length: usize = posted[0].content_length.as_deref().unwrap().parse().unwrap();
    assert_eq!(length, posted[0].body.len());
    assert!(posted[0].text().contains(std::str::from_utf8(FIRMWARE).unwrap()));
}

#[tokio::test]
async fn test_payload_closed_early_is_reopened_and_streamed() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let payload = PayloadServer::start(FIRMWARE.to_vec()).await;
    let client = connect(&device);

    let request = UpdateRequest::new(
        device.target(),
        UpdateSpec::multipart_upload(payload.url("/flaky/fw.bin")),
    );
    client.submit_update(&request).await.unwrap();

    assert_eq!(payload.state.fetches_of("/flaky/fw.bin"), 2);
    let posted = device.state.requests_to(PUSH_PATH);
    assert_eq!(posted.len(), 1);
    assert!(posted[0].content_length.is_none());
    assert!(posted[0].text().contains(std::str::from_utf8(FIRMWARE).unwrap()));
}

#[tokio::test]
async fn test_missing_actions_are_unsupported() {
    let device = MockDevice::start(DeviceConfig {
        catalog: Some(json!({"@odata.id": UPDATE_SERVICE_PATH, "Actions": {}})),
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let specs = [
        (UpdateSpec::direct_uri("https://cdn.example.com/fw.bin"), "SimpleUpdate"),
        (UpdateSpec::repository_install(None), "InstallFromRepository"),
        (UpdateSpec::multipart_upload("/srv/firmware/fw.bin"), "MultipartHttpPushUri"),
    ];
    for (spec, expected) in specs {
        let err = client
            .submit_update(&UpdateRequest::new(device.target(), spec))
            .await
            .unwrap_err();
        match err {
            ProtocolError::ProtocolUnsupported(action) => assert_eq!(action, expected),
            other => panic!("unexpected error: {other}"),
        }
    }

    let requests = device.state.requests.lock().unwrap();
    assert!(requests.iter().all(|r| r.method == "GET"));
}

#[tokio::test]
async fn test_rejected_basic_credentials_fail_without_retry() {
    let device = MockDevice::start(DeviceConfig {
        sessions_supported: false,
        reject_basic: true,
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let err = client.update_service(deadline(5)).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Authentication(_)));
    assert_eq!(device.state.requests_to(UPDATE_SERVICE_PATH).len(), 1);
    assert_eq!(client.auth_mode().await, AuthMode::Basic);
}

#[tokio::test]
async fn test_renewed_session_rejected_again_is_discarded() {
    let device = MockDevice::start(DeviceConfig {
        reject_tokens: true,
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let err = client.update_service(deadline(5)).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Authentication(_)));
    assert_eq!(device.session_creates(), 2);
    assert_eq!(device.state.requests_to(UPDATE_SERVICE_PATH).len(), 2);
    assert_eq!(client.auth_mode().await, AuthMode::Unauthenticated);
}

#[tokio::test]
async fn test_transient_action_failures_exhaust_retries() {
    for status in [503u16, 404] {
        let device = MockDevice::start(DeviceConfig {
            action_error: Some((status, "Update service busy".to_string())),
            ..Default::default()
        })
        .await;
        let client = connect(&device);

        let request = UpdateRequest::new(
            device.target(),
            UpdateSpec::direct_uri("https://cdn.example.com/fw.bin"),
        );
        let err = client.submit_update(&request).await.unwrap_err();

        assert_eq!(err.status(), Some(status));
        match &err {
            ProtocolError::RetriesExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(last.to_string().contains("Update service busy"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(device.state.requests_to(SIMPLE_UPDATE_PATH).len(), 3);
    }
}

#[tokio::test]
async fn test_permanent_action_failure_keeps_status_and_body() {
    let device = MockDevice::start(DeviceConfig {
        action_error: Some((400, "Unsupported image format".to_string())),
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let request = UpdateRequest::new(
        device.target(),
        UpdateSpec::direct_uri("https://cdn.example.com/fw.bin"),
    );
    let err = client.submit_update(&request).await.unwrap_err();

    match err {
        ProtocolError::Http { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("Unsupported image format"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(device.state.requests_to(SIMPLE_UPDATE_PATH).len(), 1);
}

#[tokio::test]
async fn test_expiring_session_renewed_once_under_concurrency() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let mut options = fast_options();
    options.session_ttl = Duration::from_millis(1500);
    options.session_renew_margin = Duration::from_secs(1);
    let client = Arc::new(
        RedfishClient::connect(&ClientFactory::new(), device.target(), options).unwrap(),
    );

    client.update_service(deadline(5)).await.unwrap();
    assert_eq!(device.session_creates(), 1);

    // now inside the renewal margin
    tokio::time::sleep(Duration::from_millis(700)).await;

    let calls = (0..8).map(|_| {
        let client = client.clone();
        async move { client.update_service(deadline(5)).await }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(device.session_creates(), 2);
    let renewed = device
        .state
        .requests_to(UPDATE_SERVICE_PATH)
        .into_iter()
        .skip(1)
        .filter(|r| r.token.as_deref() == Some("token-2"))
        .count();
    assert_eq!(renewed, 8);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_session() {
    let device = MockDevice::start(DeviceConfig {
        session_delay: Duration::from_millis(150),
        ..Default::default()
    })
    .await;
    let client = Arc::new(connect(&device));

    let calls = (0..8).map(|_| {
        let client = client.clone();
        async move { client.update_service(deadline(5)).await }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(device.session_creates(), 1);
    assert_eq!(client.auth_mode().await, AuthMode::Session);
}

#[tokio::test]
async fn test_basic_auth_when_sessions_unsupported() {
    let device = MockDevice::start(DeviceConfig {
        sessions_supported: false,
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    client.update_service(deadline(5)).await.unwrap();
    client.update_service(deadline(5)).await.unwrap();

    assert_eq!(device.session_creates(), 1);
    assert_eq!(client.auth_mode().await, AuthMode::Basic);

    let reads = device.state.requests_to("/redfish/v1/UpdateService");
    assert_eq!(reads.len(), 2);
    for read in reads {
        assert!(read.token.is_none());
        assert!(read.authorization.unwrap().starts_with("Basic "));
    }
}

#[tokio::test]
async fn test_rejected_session_is_renewed_once() {
    let device = MockDevice::start(DeviceConfig {
        revoke_first_token: true,
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    client.update_service(deadline(5)).await.unwrap();

    assert_eq!(device.session_creates(), 2);
    let tokens: Vec<_> = device
        .state
        .requests_to("/redfish/v1/UpdateService")
        .into_iter()
        .map(|r| r.token)
        .collect();
    assert_eq!(
        tokens,
        vec![Some("token-1".to_string()), Some("token-2".to_string())]
    );
}

#[tokio::test]
async fn test_poll_until_completed() {
    let device = MockDevice::start(DeviceConfig {
        task_documents: vec![
            json!({"TaskState": "Running", "PercentComplete": 10}),
            json!({"TaskState": "Running", "PercentComplete": 60}),
            json!({"TaskState": "Completed", "PercentComplete": 100}),
        ],
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let location = client.url(TASK_PATH).unwrap();
    let document = client.poll_job(&location, deadline(5)).await.unwrap();

    assert_eq!(document["PercentComplete"], 100);
    assert_eq!(device.state.requests_to(TASK_PATH).len(), 3);
}

#[tokio::test]
async fn test_failed_job_carries_document() {
    let device = MockDevice::start(DeviceConfig {
        task_documents: vec![
            json!({"JobState": "Scheduled"}),
            json!({"JobState": "Failed", "Message": "Image signature mismatch"}),
        ],
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let location = client.url(TASK_PATH).unwrap();
    let err = client.poll_job(&location, deadline(5)).await.unwrap_err();

    match err {
        ProtocolError::JobFailed { state, document } => {
            assert_eq!(state, "Failed");
            assert_eq!(document["Message"], "Image signature mismatch");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_poll_times_out_while_pending() {
    let device = MockDevice::start(DeviceConfig {
        task_documents: vec![json!({"TaskState": "Running"})],
        ..Default::default()
    })
    .await;
    let client = connect(&device);

    let location = client.url(TASK_PATH).unwrap();
    let deadline = Instant::now() + Duration::from_millis(300);
    let err = client.poll_job(&location, deadline).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Timeout(_)));
    assert!(device.state.requests_to(TASK_PATH).len() >= 2);
}

#[tokio::test]
async fn test_device_ready_once_inventory_answers() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let client = connect(&device);

    client.wait_for_device_ready(deadline(5)).await.unwrap();
    assert_eq!(
        device
            .state
            .requests_to("/redfish/v1/UpdateService/FirmwareInventory")
            .len(),
        1
    );
}

#[tokio::test]
async fn test_close_deletes_session() {
    let device = MockDevice::start(DeviceConfig::default()).await;
    let client = connect(&device);

    client.update_service(deadline(5)).await.unwrap();
    assert_eq!(client.auth_mode().await, AuthMode::Session);

    client.close().await;

    assert_eq!(client.auth_mode().await, AuthMode::Unauthenticated);
    assert_eq!(
        device
            .state
            .session_deletes
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_replacing_a_client_does_not_block_other_devices() {
    let old_address = MockDevice::start(DeviceConfig {
        session_close_delay: Duration::from_millis(800),
        ..Default::default()
    })
    .await;
    let new_address = MockDevice::start(DeviceConfig::default()).await;
    let other = MockDevice::start(DeviceConfig::default()).await;

    let pool = Arc::new(ClientPool::new(Arc::new(ClientFactory::new()), fast_options()));
    let client = pool.client_for("srv-1", &old_address.target()).await.unwrap();
    client.update_service(deadline(5)).await.unwrap();
    assert_eq!(client.auth_mode().await, AuthMode::Session);

    let replacing = {
        let pool = pool.clone();
        let target = new_address.target();
        tokio::spawn(async move { pool.client_for("srv-1", &target).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    pool.client_for("srv-2", &other.target()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(old_address.state.session_deletes.load(std::sync::atomic::Ordering::SeqCst), 0);

    let replaced = replacing.await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&client, &replaced));
    assert_eq!(old_address.state.session_deletes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(pool.len().await, 2);
}
