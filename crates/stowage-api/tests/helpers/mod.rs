#![allow(dead_code)]

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;

use stowage_api::setup::build_app;
use stowage_api::state::AppState;
use stowage_api::BackgroundTasks;
use stowage_core::config::{BootstrapStorage, JobQueueSettings};
use stowage_core::{Config, UploadThresholds};

pub const IDENTITY: &str = "u_test";

/// Test application backed by a temporary SQLite file and local storage root
pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub background: BackgroundTasks,
    pub _temp_dir: TempDir,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    pub fn public_base_url(&self) -> &str {
        &self.state.config.public_base_url
    }

    /// Turn an absolute URL handed out by the service into a path the test server accepts.
    pub fn path_of<'a>(&self, url: &'a str) -> &'a str {
        url.strip_prefix(self.public_base_url()).unwrap_or(url)
    }
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with_thresholds(UploadThresholds::default()).await
}

pub async fn setup_test_app_with_thresholds(thresholds: UploadThresholds) -> TestApp {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage_root = temp_dir.path().join("objects");

    let config = Config {
        database_path: temp_dir
            .path()
            .join("stowage.db")
            .to_string_lossy()
            .into_owned(),
        upload_thresholds: thresholds,
        bootstrap_storage: Some(BootstrapStorage::Local {
            path: storage_root.to_string_lossy().into_owned(),
        }),
        job_queue: JobQueueSettings {
            poll_interval_ms: 20,
            ..JobQueueSettings::default()
        },
        ..Config::default()
    };

    let (state, router, background) = build_app(config)
        .await
        .expect("Failed to build application");
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        state,
        background,
        _temp_dir: temp_dir,
    }
}

/// Create a workspace on the bootstrapped storage and return its JSON representation.
pub async fn create_workspace(client: &TestServer) -> Value {
    let storages = client
        .get("/api/storages")
        .add_header("x-stowage-identity", IDENTITY)
        .await;
    assert_eq!(storages.status_code(), 200);
    let storages: Value = storages.json();
    let storage_id = storages[0]["id"]
        .as_str()
        .expect("bootstrap storage is listed")
        .to_string();

    let response = client
        .post("/api/workspaces")
        .add_header("x-stowage-identity", IDENTITY)
        .json(&json!({
            "name": "Test workspace",
            "storageId": storage_id,
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    response.json()
}

/// Initiate an upload and return the response body.
pub async fn initiate_upload(client: &TestServer, workspace_id: &str, name: &str, size: u64) -> Value {
    let response = client
        .post(&format!("/api/workspaces/{}/uploads", workspace_id))
        .add_header("x-stowage-identity", IDENTITY)
        .json(&json!({
            "name": name,
            "contentType": "application/octet-stream",
            "sizeInBytes": size,
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    response.json()
}
