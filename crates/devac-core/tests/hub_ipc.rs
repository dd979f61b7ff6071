use std::path::Path;

use devac_core::config::DevacConfig;
use devac_core::errors::DevacError;
use devac_core::hub::{CrossRepoEdge, HubClient, HubServer};
use devac_core::models::{ParseResult, BASE_BRANCH};
use devac_core::query::guards::MAX_IPC_LINE_BYTES;
use devac_core::store::{EnginePool, SeedWriter};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn config(hub_dir: &Path) -> DevacConfig {
    let mut config = DevacConfig::default();
    config.hub.hub_dir = hub_dir.to_string_lossy().into_owned();
    config
}

fn seed_package(root: &Path) {
    let parsed: ParseResult = serde_json::from_value(json!({
        "filePath": "src/lib.ts",
        "sourceFileHash": "abc",
        "nodes": [
            {"entity_id": "lib:core:function:1", "name": "render", "kind": "function", "file_path": "src/lib.ts"},
            {"entity_id": "lib:core:function:2", "name": "mount", "kind": "function", "file_path": "src/lib.ts"}
        ]
    }))
    .unwrap();
    let pool = EnginePool::with_defaults().unwrap();
    assert!(SeedWriter::new(root, pool).write_file(BASE_BRANCH, &parsed).success);
}

#[tokio::test]
async fn serves_registry_and_queries_over_socket() {
    let hub_dir = tempfile::tempdir().unwrap();
    let repo = tempfile::tempdir().unwrap();
    seed_package(&repo.path().join("packages/core"));

    let handle = HubServer::new(config(hub_dir.path())).start().await.unwrap();
    let mut client = HubClient::connect(handle.socket_path()).await.unwrap();
    client.ping().await.unwrap();

    let info = client.register(repo.path()).await.unwrap();
    assert_eq!(info.packages.len(), 1);
    assert!(!info.content_hash.is_empty());

    let repos = client.list_repos().await.unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].repo_id, info.repo_id);

    let result = client
        .query("SELECT name FROM nodes ORDER BY name")
        .await
        .unwrap();
    let names: Vec<&str> = result.rows.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["mount", "render"]);

    let edge = CrossRepoEdge {
        source_repo: "github.com/acme/app".into(),
        source_entity_id: "app:web:function:9".into(),
        target_repo: info.repo_id.clone(),
        target_entity_id: "lib:core:function:1".into(),
        edge_type: "CALLS".into(),
        metadata: json!({}),
    };
    assert_eq!(client.add_cross_repo_edges(&[edge.clone()]).await.unwrap(), 1);
    let dependents = client.get_dependents("lib:core:function:1").await.unwrap();
    assert_eq!(dependents, vec![edge]);

    assert!(client.unregister(&info.repo_id).await.unwrap());
    assert!(client.list_repos().await.unwrap().is_empty());

    client.shutdown().await.unwrap();
    handle.wait().await.unwrap();
    assert!(!hub_dir.path().join("mcp.sock").exists());
}

#[tokio::test]
async fn malformed_and_unknown_requests_get_error_replies() {
    let hub_dir = tempfile::tempdir().unwrap();
    let handle = HubServer::new(config(hub_dir.path())).start().await.unwrap();
    let mut client = HubClient::connect(handle.socket_path()).await.unwrap();

    let reply = client.send_raw("{not json").await.unwrap();
    assert_eq!(reply.error.unwrap().code, -32700);

    let reply = client
        .send_raw(r#"{"id": 7, "method": "dropEverything"}"#)
        .await
        .unwrap();
    assert_eq!(reply.id, json!(7));
    assert_eq!(reply.error.unwrap().code, -32601);

    // The connection survives both errors.
    client.ping().await.unwrap();
    handle.shutdown();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn second_hub_is_refused_while_first_runs() {
    let hub_dir = tempfile::tempdir().unwrap();
    let first = HubServer::new(config(hub_dir.path())).start().await.unwrap();

    let second = HubServer::new(config(hub_dir.path())).start().await;
    assert!(matches!(second, Err(DevacError::HubAlreadyRunning(_))));

    first.shutdown();
    first.wait().await.unwrap();

    // Once the owner is gone the directory can be taken over.
    let third = HubServer::new(config(hub_dir.path())).start().await.unwrap();
    third.shutdown();
    third.wait().await.unwrap();
}

#[tokio::test]
async fn stale_socket_is_reclaimed() {
    let hub_dir = tempfile::tempdir().unwrap();
    let socket = hub_dir.path().join("mcp.sock");
    // A crashed hub leaves its socket file behind with nobody listening.
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let handle = HubServer::new(config(hub_dir.path())).start().await.unwrap();
    let mut client = HubClient::connect(&socket).await.unwrap();
    client.ping().await.unwrap();
    client.shutdown().await.unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn unterminated_oversized_request_is_rejected_and_dropped() {
    let hub_dir = tempfile::tempdir().unwrap();
    let handle = HubServer::new(config(hub_dir.path())).start().await.unwrap();

    let stream = UnixStream::connect(handle.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let flood = vec![b'a'; MAX_IPC_LINE_BYTES + 1];
    write_half.write_all(&flood).await.unwrap();

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["error"]["code"], json!(-32600));
    assert_eq!(reply["id"], Value::Null);

    // The server hangs up after the error reply.
    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).await.unwrap(), 0);

    // Other clients are unaffected.
    let mut client = HubClient::connect(handle.socket_path()).await.unwrap();
    client.ping().await.unwrap();
    client.shutdown().await.unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_idle_clients_before_releasing_the_hub() {
    let hub_dir = tempfile::tempdir().unwrap();
    let handle = HubServer::new(config(hub_dir.path())).start().await.unwrap();

    let mut idle = HubClient::connect(handle.socket_path()).await.unwrap();
    idle.ping().await.unwrap();
    let mut closer = HubClient::connect(handle.socket_path()).await.unwrap();
    closer.shutdown().await.unwrap();
    handle.wait().await.unwrap();

    // The idle connection was closed during the drain.
    assert!(idle.ping().await.is_err());
    assert!(!hub_dir.path().join("mcp.sock").exists());

    // Lock and socket are free for the next owner.
    let next = HubServer::new(config(hub_dir.path())).start().await.unwrap();
    next.shutdown();
    next.wait().await.unwrap();
}
