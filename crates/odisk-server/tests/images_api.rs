use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use odisk_media::{CommandRunner, DiskError};
use odisk_server::announce::LogAnnouncer;
use odisk_server::{start_with, RunningServer, ServerConfig};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tempfile::TempDir;

/// No drives attached and no disc tools installed.
struct NoTools;

#[async_trait]
impl CommandRunner for NoTools {
    async fn run(&self, program: &str, _args: &[&str]) -> odisk_media::Result<String> {
        Err(DiskError::DeviceQueryFailed {
            tool: program.to_string(),
            reason: "not installed".to_string(),
        })
    }
}

async fn spawn_server(image_root: &std::path::Path) -> RunningServer {
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    start_with(
        ServerConfig::new(bind_addr, image_root),
        Arc::new(NoTools),
        Arc::new(LogAnnouncer),
    )
    .await
    .unwrap()
}

fn upload_form(file_name: &str, bytes: Vec<u8>) -> Form {
    Form::new().part("image", Part::bytes(bytes).file_name(file_name.to_string()))
}

#[tokio::test]
async fn list_images_describes_each_disk() {
    let tmp = TempDir::new().unwrap();
    tokio::fs::write(tmp.path().join("a.iso"), vec![0u8; 1234])
        .await
        .unwrap();
    tokio::fs::create_dir(tmp.path().join("nested")).await.unwrap();
    tokio::fs::write(tmp.path().join("nested/b.dmg"), vec![0u8; 99])
        .await
        .unwrap();
    tokio::fs::write(tmp.path().join("notes.txt"), b"ignored")
        .await
        .unwrap();

    let server = spawn_server(tmp.path()).await;
    let addr = server.addr();

    let resp = reqwest::get(format!("http://{addr}/images")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let disks: serde_json::Value = resp.json().await.unwrap();
    let disks = disks.as_object().unwrap();
    assert_eq!(disks.len(), 2);
    assert_eq!(disks["disk0"]["kind"], "image");
    assert_eq!(disks["disk0"]["state"], "READY");
    assert_eq!(disks["disk0"]["size"], 1234);
    assert!(disks["disk0"]["filename"].as_str().unwrap().ends_with("a.iso"));
    assert_eq!(disks["disk1"]["size"], 99);
    assert!(disks["disk0"]["label"].is_null());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn upload_adds_a_disk() {
    let tmp = TempDir::new().unwrap();
    let server = spawn_server(tmp.path()).await;
    let addr = server.addr();
    assert!(server.registry().snapshot().is_empty());

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/images"))
        .multipart(upload_form("../../uploaded.IMG", vec![7u8; 4096]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["size"], 4096);
    assert_eq!(body["success"], true);

    // Only the final path component is kept, inside the image root.
    let written = tokio::fs::read(tmp.path().join("uploaded.IMG")).await.unwrap();
    assert_eq!(written, vec![7u8; 4096]);
    let snapshot = server.registry().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.get("disk0").is_some());

    // No partial files are left behind.
    let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["uploaded.IMG".to_string()]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn upload_rejects_non_image_extensions() {
    let tmp = TempDir::new().unwrap();
    let server = spawn_server(tmp.path()).await;
    let addr = server.addr();

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/images"))
        .multipart(upload_form("payload.exe", vec![1, 2, 3]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("payload.exe"));
    assert!(!tmp.path().join("payload.exe").exists());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn upload_without_image_field_is_a_bad_request() {
    let tmp = TempDir::new().unwrap();
    let server = spawn_server(tmp.path()).await;
    let addr = server.addr();

    let form = Form::new().text("comment", "nothing attached");
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/images"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_is_not_implemented_for_known_disks() {
    let tmp = TempDir::new().unwrap();
    tokio::fs::write(tmp.path().join("a.iso"), vec![0u8; 10])
        .await
        .unwrap();
    let server = spawn_server(tmp.path()).await;
    let addr = server.addr();
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("http://{addr}/images/disk0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    assert!(tmp.path().join("a.iso").exists());

    let resp = client
        .delete(format!("http://{addr}/images/disk5"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_fails_for_a_missing_image_root() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("does-not-exist");
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let err = start_with(
        ServerConfig::new(bind_addr, &missing),
        Arc::new(NoTools),
        Arc::new(LogAnnouncer),
    )
    .await
    .err()
    .expect("start should fail");
    assert!(format!("{err:#}").contains("does-not-exist"), "{err:#}");
}

#[tokio::test]
async fn healthz_is_served() {
    let tmp = TempDir::new().unwrap();
    let server = spawn_server(tmp.path()).await;

    let resp = reqwest::get(format!("http://{}/healthz", server.addr()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");

    server.shutdown().await.unwrap();
}
