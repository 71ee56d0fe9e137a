//! HTTP client for the control server's agent API
//!
//! Every endpoint answers with a `{code, message, data}` wrapper; anything
//! but `code == 200` is an error even when the HTTP status is 2xx.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use es_core::traits::ControlPlane;
use es_core::types::RegisterRequest;
use es_core::{AgentId, ControlPlaneError, HeartbeatReport, JobResultReport, LogLineReport};

use crate::remote_config::RemoteConfigSource;

/// Per-request deadline
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const REGISTER_PATH: &str = "/api/v1/agent/register";
const HEARTBEAT_PATH: &str = "/api/v1/agent/heartbeat";
const JOB_RESULT_PATH: &str = "/api/v1/agent/jobs/result";
const JOB_LOG_PATH: &str = "/api/v1/agent/jobs/log";
const CONFIG_PATH: &str = "/api/v1/agent/config";

/// Success code inside the response wrapper
const API_OK: i64 = 200;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Client for the plain request path
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    http: Client,
}

impl ControlPlaneClient {
    pub fn new(server_url: &str) -> Result<Self, ControlPlaneError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ControlPlaneError::Transport {
                method: "INIT",
                path: String::new(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            base_url: server_url.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Announce this host; called once at startup
    pub async fn register(&self, request: &RegisterRequest) -> Result<(), ControlPlaneError> {
        self.post(REGISTER_PATH, request).await?;
        tracing::info!(agent_id = %request.agent_id, "agent registered");
        Ok(())
    }

    /// Fetch this agent's remote key/value configuration
    pub async fn fetch_config(
        &self,
        agent_id: &AgentId,
    ) -> Result<HashMap<String, String>, ControlPlaneError> {
        let url = format!("{}{}", self.base_url, CONFIG_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[("agentId", agent_id.as_str())])
            .send()
            .await
            .map_err(|e| transport("GET", CONFIG_PATH, e))?;

        let body = read_response("GET", CONFIG_PATH, response).await?;
        match body.data {
            None | Some(Value::Null) => Ok(HashMap::new()),
            Some(Value::Object(entries)) => Ok(entries
                .into_iter()
                .filter_map(|(key, value)| config_value(value).map(|v| (key, v)))
                .collect()),
            Some(other) => Err(ControlPlaneError::Decode(format!(
                "config data is not an object: {}",
                other
            ))),
        }
    }

    async fn post<T>(&self, path: &'static str, body: &T) -> Result<ApiResponse, ControlPlaneError>
    where
        T: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport("POST", path, e))?;

        read_response("POST", path, response).await
    }
}

fn transport(method: &'static str, path: &str, error: reqwest::Error) -> ControlPlaneError {
    ControlPlaneError::Transport {
        method,
        path: path.to_string(),
        reason: error.to_string(),
    }
}

async fn read_response(
    method: &'static str,
    path: &str,
    response: Response,
) -> Result<ApiResponse, ControlPlaneError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport(method, path, e))?;

    if !status.is_success() {
        return Err(ControlPlaneError::Status {
            method,
            path: path.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let wrapper: ApiResponse =
        serde_json::from_str(&body).map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
    if wrapper.code != API_OK {
        return Err(ControlPlaneError::Api {
            code: wrapper.code,
            message: wrapper.message,
        });
    }
    Ok(wrapper)
}

/// Config values arrive as strings, but numbers and booleans are accepted
/// too. Nested values are skipped.
fn config_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn report_result(&self, report: &JobResultReport) -> Result<(), ControlPlaneError> {
        self.post(JOB_RESULT_PATH, report).await?;
        Ok(())
    }

    async fn report_log(&self, job_id: &str, line: &str) -> Result<(), ControlPlaneError> {
        let report = LogLineReport {
            job_id: job_id.to_string(),
            log: line.to_string(),
        };
        self.post(JOB_LOG_PATH, &report).await?;
        Ok(())
    }

    async fn send_heartbeat(&self, report: &HeartbeatReport) -> Result<(), ControlPlaneError> {
        self.post(HEARTBEAT_PATH, report).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteConfigSource for ControlPlaneClient {
    async fn fetch_config(
        &self,
        agent_id: &AgentId,
    ) -> Result<HashMap<String, String>, ControlPlaneError> {
        ControlPlaneClient::fetch_config(self, agent_id).await
    }
}
