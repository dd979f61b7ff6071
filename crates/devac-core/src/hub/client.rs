//! Client side of the hub socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::trace;

use crate::errors::{DevacError, DevacResult};
use crate::hub::protocol::{HubMethod, RpcRequest, RpcResponse};
use crate::hub::registry::{CrossRepoEdge, RepoInfo};
use crate::query::QueryResult;

pub struct HubClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl HubClient {
    pub async fn connect(socket_path: &Path) -> DevacResult<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            DevacError::Hub(format!("cannot connect to hub at {}: {e}", socket_path.display()))
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
            next_id: 1,
        })
    }

    pub async fn connect_with_timeout(socket_path: &Path, timeout: Duration) -> DevacResult<Self> {
        tokio::time::timeout(timeout, Self::connect(socket_path))
            .await
            .map_err(|_| DevacError::Hub(format!("timed out connecting to {}", socket_path.display())))?
    }

    /// Send one already-encoded line and read the reply.
    pub async fn send_raw(&mut self, line: &str) -> DevacResult<RpcResponse> {
        trace!(request = %line, "hub request");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        let reply = self
            .reader
            .next_line()
            .await?
            .ok_or_else(|| DevacError::Hub("hub closed the connection".to_string()))?;
        trace!(response = %reply, "hub response");
        Ok(serde_json::from_str(&reply)?)
    }

    pub async fn request(&mut self, method: HubMethod, params: Value) -> DevacResult<RpcResponse> {
        let id = self.next_id;
        self.next_id += 1;
        let line = serde_json::to_string(&RpcRequest::new(id, method, params))?;
        self.send_raw(&line).await
    }

    /// Call `method`; an error response becomes `DevacError::Hub`.
    pub async fn call(&mut self, method: HubMethod, params: Value) -> DevacResult<Value> {
        let response = self.request(method, params).await?;
        if let Some(err) = response.error {
            return Err(DevacError::Hub(format!(
                "{} failed ({}): {}",
                method.as_str(),
                err.code,
                err.message
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn call_as<T: DeserializeOwned>(&mut self, method: HubMethod, params: Value) -> DevacResult<T> {
        Ok(serde_json::from_value(self.call(method, params).await?)?)
    }

    pub async fn ping(&mut self) -> DevacResult<()> {
        self.call(HubMethod::Ping, Value::Null).await.map(|_| ())
    }

    pub async fn shutdown(&mut self) -> DevacResult<()> {
        self.call(HubMethod::Shutdown, Value::Null).await.map(|_| ())
    }

    pub async fn register(&mut self, path: &Path) -> DevacResult<RepoInfo> {
        self.call_as(HubMethod::Register, json!({ "path": PathBuf::from(path) }))
            .await
    }

    pub async fn unregister(&mut self, repo_id: &str) -> DevacResult<bool> {
        let v = self
            .call(HubMethod::Unregister, json!({ "repoId": repo_id }))
            .await?;
        Ok(v.get("removed").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn list_repos(&mut self) -> DevacResult<Vec<RepoInfo>> {
        self.call_as(HubMethod::ListRepos, Value::Null).await
    }

    pub async fn query(&mut self, sql: &str) -> DevacResult<QueryResult> {
        self.call_as(HubMethod::Query, json!({ "sql": sql })).await
    }

    pub async fn add_cross_repo_edges(&mut self, edges: &[CrossRepoEdge]) -> DevacResult<usize> {
        let v = self
            .call(HubMethod::AddCrossRepoEdges, json!({ "edges": edges }))
            .await?;
        Ok(v.get("added").and_then(Value::as_u64).unwrap_or(0) as usize)
    }

    pub async fn get_dependents(&mut self, target: &str) -> DevacResult<Vec<CrossRepoEdge>> {
        self.call_as(HubMethod::GetDependents, json!({ "target": target }))
            .await
    }
}
