//! Integration tests for document persistence across server restarts.
//!
//! Verifies:
//! 1. Saved cells survive a restart, with the version reset to 0
//! 2. The catalog file is written in its record format and reloaded
//! 3. Shutdown flushes sessions that still have unsaved changes
//! 4. Documents written by older servers load correctly

use sheetsync_collab::client::SyncClient;
use sheetsync_collab::protocol::Response;
use sheetsync_collab::server::{ServerConfig, SheetServer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

struct RunningServer {
    addr: SocketAddr,
    server: Arc<SheetServer>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn start(dir: &Path) -> Self {
        let server = Arc::new(SheetServer::open(ServerConfig::for_testing(dir)).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        let task = tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });
        Self { addr, server, task }
    }

    /// Stop accepting and flush live sessions, like Ctrl-C does.
    async fn stop(self) -> usize {
        self.task.abort();
        self.server.directory().shutdown().await
    }
}

#[tokio::test]
async fn test_saved_cells_survive_restart() {
    let dir = tempdir().unwrap();

    let first = RunningServer::start(dir.path()).await;
    let mut client = SyncClient::connect(first.addr).await.unwrap();
    client.create("budget", "pw").await.unwrap();
    client.join("budget", "pw").await.unwrap();
    for (version, (cell, content)) in [("A1", "5"), ("B2", "=A1*2"), ("C3", "x < y")]
        .into_iter()
        .enumerate()
    {
        client.change("budget", version as u64, cell, content).await.unwrap();
        assert!(matches!(
            client.recv_timeout(TIMEOUT).await.unwrap(),
            Response::ChangeOk { .. }
        ));
    }
    client.save("budget").await.unwrap();
    assert!(matches!(
        client.recv_timeout(TIMEOUT).await.unwrap(),
        Response::SaveOk { .. }
    ));
    assert_eq!(first.stop().await, 0);

    let second = RunningServer::start(dir.path()).await;
    let mut client = SyncClient::connect(second.addr).await.unwrap();
    let joined = client.join("budget", "pw").await.unwrap();
    assert_eq!(joined.version, 0);
    assert_eq!(joined.cells.len(), 3);
    assert_eq!(joined.cells.get("B2"), "=A1*2");
    assert_eq!(joined.cells.get("C3"), "x < y");
}

#[tokio::test]
async fn test_shutdown_flushes_unsaved_changes() {
    let dir = tempdir().unwrap();

    let first = RunningServer::start(dir.path()).await;
    let mut client = SyncClient::connect(first.addr).await.unwrap();
    client.create("budget", "pw").await.unwrap();
    client.join("budget", "pw").await.unwrap();
    client.change("budget", 0, "A1", "unsaved").await.unwrap();
    client.recv_timeout(TIMEOUT).await.unwrap();
    assert_eq!(first.stop().await, 1);

    let second = RunningServer::start(dir.path()).await;
    let mut client = SyncClient::connect(second.addr).await.unwrap();
    let joined = client.join("budget", "pw").await.unwrap();
    assert_eq!(joined.cells.get("A1"), "unsaved");
}

#[tokio::test]
async fn test_catalog_records_and_reload() {
    let dir = tempdir().unwrap();

    let first = RunningServer::start(dir.path()).await;
    let mut client = SyncClient::connect(first.addr).await.unwrap();
    client.create("budget", "hunter2").await.unwrap();
    client.create("notes", "").await.unwrap();
    first.stop().await;

    let catalog = std::fs::read_to_string(dir.path().join("spreadsheet_files.txt")).unwrap();
    let lines: Vec<&str> = catalog.lines().collect();
    assert_eq!(lines.len(), 8);
    assert_eq!(&lines[..3], &["", "budget", "hunter2"]);
    assert!(lines[3].ends_with(".xml"));
    assert!(dir.path().join(lines[3]).exists());
    assert_eq!(&lines[4..7], &["", "notes", ""]);

    let second = RunningServer::start(dir.path()).await;
    assert_eq!(second.server.directory().catalog().len().await, 2);
    let mut client = SyncClient::connect(second.addr).await.unwrap();
    assert!(client.join("notes", "").await.unwrap().cells.is_empty());
}

#[tokio::test]
async fn test_loads_legacy_document() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("spreadsheet_files.txt"),
        "\nlegacy\nsecret\nold.xml\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("old.xml"),
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n<spreadsheet>\r\n\
         <cell><name>A1</name><contents>42</contents></cell>\r\n\
         <cell><name>A2</name><contents></contents></cell>\r\n\
         </spreadsheet>",
    )
    .unwrap();

    let server = RunningServer::start(dir.path()).await;
    let mut client = SyncClient::connect(server.addr).await.unwrap();
    let joined = client.join("legacy", "secret").await.unwrap();
    assert_eq!(joined.cells.len(), 1);
    assert_eq!(joined.cells.get("A1"), "42");
}
