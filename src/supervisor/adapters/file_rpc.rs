//! Generic HTTP downloader over an RPC control channel (§4.4.1). Used for
//! `file` kind jobs: instead of owning a child process directly, this
//! adapter submits the job to an aria2 daemon over JSON-RPC and polls it.

use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::domain::Job;
use crate::supervisor::adapter::{Artifact, PollHandle, PollState, PollingAdapter, Snapshot};

pub struct FileRpcAdapter {
    client: reqwest::blocking::Client,
    rpc_url: String,
    secret: Option<String>,
}

impl FileRpcAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            rpc_url: config.aria2_rpc_url.clone(),
            secret: config.aria2_secret.clone(),
        }
    }

    fn token_param(&self) -> Vec<serde_json::Value> {
        match &self.secret {
            Some(secret) => vec![json!(format!("token:{secret}"))],
            None => Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Deserialize)]
struct AddUriResult(String);

#[derive(Deserialize)]
struct TellStatusResult {
    status: String,
    #[serde(rename = "completedLength")]
    completed_length: String,
    #[serde(rename = "totalLength")]
    total_length: String,
    #[serde(rename = "downloadSpeed")]
    download_speed: String,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<TellStatusFile>,
}

#[derive(Deserialize)]
struct TellStatusFile {
    path: String,
    length: String,
}

impl PollingAdapter for FileRpcAdapter {
    fn start(&self, job: &Job, work_dir: &std::path::Path) -> anyhow::Result<PollHandle> {
        let mut params = self.token_param();
        params.push(json!([job.url]));
        params.push(json!({"dir": work_dir.display().to_string()}));
        let body = json!({
            "jsonrpc": "2.0",
            "id": job.id.to_string(),
            "method": "aria2.addUri",
            "params": params,
        });
        let resp: RpcResponse<AddUriResult> = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()?
            .json()?;
        if let Some(err) = resp.error {
            anyhow::bail!("aria2 addUri failed: {}", err.message);
        }
        let gid = resp.result.ok_or_else(|| anyhow::anyhow!("aria2 addUri returned no gid"))?;
        Ok(PollHandle(gid.0))
    }

    fn poll(&self, handle: &PollHandle) -> anyhow::Result<Snapshot> {
        let mut params = self.token_param();
        params.push(json!(handle.0));
        let body = json!({
            "jsonrpc": "2.0",
            "id": handle.0,
            "method": "aria2.tellStatus",
            "params": params,
        });
        let resp: RpcResponse<TellStatusResult> = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()?
            .json()?;
        if let Some(err) = resp.error {
            anyhow::bail!("aria2 tellStatus failed: {}", err.message);
        }
        let result = resp.result.ok_or_else(|| anyhow::anyhow!("aria2 tellStatus returned no result"))?;
        let state = match result.status.as_str() {
            "complete" => PollState::Complete,
            "error" => PollState::Error,
            "removed" => PollState::Removed,
            _ => PollState::Active,
        };
        let files = result
            .files
            .iter()
            .map(|f| Artifact {
                filename: std::path::Path::new(&f.path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("download")
                    .to_string(),
                path: std::path::PathBuf::from(&f.path),
                size: f.length.parse().ok(),
            })
            .collect();
        Ok(Snapshot {
            state,
            completed_bytes: result.completed_length.parse().unwrap_or(0),
            total_bytes: result.total_length.parse().unwrap_or(0),
            speed_bytes_per_sec: result.download_speed.parse().unwrap_or(0.0),
            error_message: result.error_message,
            files,
        })
    }

    fn cancel(&self, handle: &PollHandle) -> anyhow::Result<()> {
        let mut params = self.token_param();
        params.push(json!(handle.0));
        let body = json!({
            "jsonrpc": "2.0",
            "id": handle.0,
            "method": "aria2.forceRemove",
            "params": params,
        });
        let _: RpcResponse<serde_json::Value> = self.client.post(&self.rpc_url).json(&body).send()?.json()?;
        Ok(())
    }
}
