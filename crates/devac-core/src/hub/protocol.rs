//! Hub IPC wire types: newline-delimited JSON over a local socket.
//!
//! Request `{id, method, params}`; success `{id, result}`; failure
//! `{id, error: {code, message}}`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DevacError;
use crate::hub::registry::{CrossRepoEdge, Diagnostic, DiagnosticsFilter};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const HUB_NOT_READY: i32 = -32000;
pub const OPERATION_FAILED: i32 = -32001;

/// Fixed dispatch table of hub methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubMethod {
    Ping,
    Shutdown,
    Register,
    Unregister,
    Refresh,
    RefreshAll,
    ListRepos,
    GetRepo,
    Query,
    AddCrossRepoEdges,
    GetDependents,
    PushDiagnostics,
    QueryDiagnostics,
    ClearDiagnostics,
    DiagnosticsSummary,
}

impl HubMethod {
    pub const ALL: &'static [HubMethod] = &[
        HubMethod::Ping,
        HubMethod::Shutdown,
        HubMethod::Register,
        HubMethod::Unregister,
        HubMethod::Refresh,
        HubMethod::RefreshAll,
        HubMethod::ListRepos,
        HubMethod::GetRepo,
        HubMethod::Query,
        HubMethod::AddCrossRepoEdges,
        HubMethod::GetDependents,
        HubMethod::PushDiagnostics,
        HubMethod::QueryDiagnostics,
        HubMethod::ClearDiagnostics,
        HubMethod::DiagnosticsSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Refresh => "refresh",
            Self::RefreshAll => "refreshAll",
            Self::ListRepos => "listRepos",
            Self::GetRepo => "getRepo",
            Self::Query => "query",
            Self::AddCrossRepoEdges => "addCrossRepoEdges",
            Self::GetDependents => "getDependents",
            Self::PushDiagnostics => "pushDiagnostics",
            Self::QueryDiagnostics => "queryDiagnostics",
            Self::ClearDiagnostics => "clearDiagnostics",
            Self::DiagnosticsSummary => "diagnosticsSummary",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Methods that mutate hub state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Register
                | Self::Unregister
                | Self::Refresh
                | Self::RefreshAll
                | Self::AddCrossRepoEdges
                | Self::PushDiagnostics
                | Self::ClearDiagnostics
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: HubMethod, params: Value) -> Self {
        Self {
            id: Value::from(id),
            method: method.as_str().to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&DevacError> for RpcError {
    fn from(err: &DevacError) -> Self {
        let code = match err {
            DevacError::InvalidParams(_) | DevacError::UriParse(_) | DevacError::QueryPreprocess(_) => {
                INVALID_PARAMS
            }
            DevacError::HubReadOnly(_) => HUB_NOT_READY,
            _ => OPERATION_FAILED,
        };
        RpcError::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Method params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoIdParams {
    pub repo_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedQueryParams {
    pub sql: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEdgesParams {
    pub edges: Vec<CrossRepoEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentsParams {
    /// Target entity ID or repo ID.
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDiagnosticsParams {
    pub repo_id: String,
    pub source: String,
    pub records: Vec<Diagnostic>,
}

pub type QueryDiagnosticsParams = DiagnosticsFilter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClearDiagnosticsParams {
    pub repo_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummaryParams {
    pub repo_id: Option<String>,
}
