//! External engine adapter: aria2 over its local JSON-RPC channel.
//!
//! The daemon is a black box reachable at a local endpoint. This
//! adapter translates session parameters into aria2's option map,
//! tracks the returned GID, and maps `tellStatus` responses back into
//! the engine contract. Reachability problems at startup surface as
//! `EngineUnavailable`, which is distinct from a task failure and makes
//! the orchestrator fall back to the direct engine.

use std::future::Future;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::{EngineHandle, EngineStatus, TransferEngine};
use crate::error::{CoreError, Result};
use crate::task::{DownloadTask, TransferSession};

/// The slice of aria2's RPC surface this adapter consumes.
///
/// Kept as a trait so tests can script the daemon; `Aria2Rpc` is the
/// real client. All methods are safe to call from concurrent task
/// workers.
pub trait Aria2Api: Send + Sync {
    fn add_uri(
        &self,
        uris: Vec<String>,
        options: Value,
    ) -> impl Future<Output = Result<String>> + Send;

    fn tell_status(&self, gid: &str) -> impl Future<Output = Result<Aria2Status>> + Send;

    fn remove(&self, gid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Cheap reachability probe; errors map to `EngineUnavailable`.
    fn get_version(&self) -> impl Future<Output = Result<String>> + Send;
}

impl<T: Aria2Api> Aria2Api for std::sync::Arc<T> {
    async fn add_uri(&self, uris: Vec<String>, options: Value) -> Result<String> {
        (**self).add_uri(uris, options).await
    }

    async fn tell_status(&self, gid: &str) -> Result<Aria2Status> {
        (**self).tell_status(gid).await
    }

    async fn remove(&self, gid: &str) -> Result<()> {
        (**self).remove(gid).await
    }

    async fn get_version(&self) -> Result<String> {
        (**self).get_version().await
    }
}

/// Parsed `tellStatus` result. aria2 serializes numbers as strings.
#[derive(Debug, Clone, Default)]
pub struct Aria2Status {
    pub status: String,
    pub completed_length: u64,
    pub total_length: u64,
    pub download_speed: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    status: String,
    #[serde(default)]
    completed_length: Option<String>,
    #[serde(default)]
    total_length: Option<String>,
    #[serde(default)]
    download_speed: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl Aria2Status {
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawStatus = serde_json::from_value(value)
            .map_err(|e| CoreError::Network(format!("malformed tellStatus reply: {e}")))?;
        Ok(Self {
            status: raw.status,
            completed_length: parse_len(raw.completed_length),
            total_length: parse_len(raw.total_length),
            download_speed: parse_len(raw.download_speed),
            error_code: raw.error_code,
            error_message: raw.error_message,
        })
    }
}

fn parse_len(field: Option<String>) -> u64 {
    field.and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// `TransferEngine` backed by an aria2 daemon.
pub struct Aria2Engine<A: Aria2Api> {
    api: A,
    user_agent: String,
}

impl<A: Aria2Api> Aria2Engine<A> {
    pub fn new(api: A, user_agent: impl Into<String>) -> Self {
        Self {
            api,
            user_agent: user_agent.into(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Map a session onto aria2's option dictionary. Every value is a
    /// string; that is the RPC convention.
    fn options(&self, task: &DownloadTask, session: &TransferSession) -> Value {
        let params = &session.params;
        let dir = task
            .destination
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());

        let mut headers = vec![format!("User-Agent: {}", self.user_agent)];
        if let Some(cookie) = &task.cookie {
            headers.push(format!("Cookie: {cookie}"));
        }

        json!({
            "dir": dir,
            "out": task.name,
            "max-connection-per-server": params.max_connections.to_string(),
            "split": params.split.to_string(),
            "min-split-size": params.min_split_size.to_string(),
            "stream-piece-selector": params.piece_selection.as_str(),
            "continue": params.continue_partial.to_string(),
            "allow-overwrite": params.allow_overwrite.to_string(),
            "auto-file-renaming": "false",
            "max-tries": params.max_tries.to_string(),
            "retry-wait": params.retry_wait_secs.to_string(),
            "max-download-limit": params.max_download_limit.to_string(),
            "max-concurrent-downloads": "1",
            "header": headers,
        })
    }
}

impl<A: Aria2Api> TransferEngine for Aria2Engine<A> {
    async fn start(&self, task: &DownloadTask, session: &TransferSession) -> Result<EngineHandle> {
        let options = self.options(task, session);
        let gid = self.api.add_uri(vec![session.url.clone()], options).await?;
        debug!(task = %task.id, gid, "aria2 session started");
        Ok(EngineHandle(gid))
    }

    async fn poll(&self, handle: &EngineHandle) -> Result<EngineStatus> {
        let status = self.api.tell_status(&handle.0).await?;

        let error = if status.status == "error" {
            Some(match (&status.error_code, &status.error_message) {
                (_, Some(msg)) if !msg.is_empty() => msg.clone(),
                (Some(code), _) => format!("aria2 error code {code}"),
                _ => "aria2 reported an unspecified error".to_string(),
            })
        } else {
            None
        };

        Ok(EngineStatus {
            completed_bytes: status.completed_length,
            total_bytes: status.total_length,
            speed_bps: status.download_speed,
            is_active: matches!(status.status.as_str(), "active" | "waiting" | "paused"),
            is_complete: status.status == "complete",
            error,
        })
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<()> {
        // The GID may already be gone (completed or errored out);
        // releasing it is best-effort.
        if let Err(e) = self.api.remove(&handle.0).await {
            warn!(gid = %handle.0, error = %e, "failed to remove aria2 download");
        }
        Ok(())
    }
}

#[cfg(feature = "reqwest")]
mod rpc {
    use super::*;

    /// JSON-RPC client for a locally running aria2 daemon.
    pub struct Aria2Rpc {
        http: reqwest::Client,
        endpoint: String,
        secret: Option<String>,
    }

    impl Aria2Rpc {
        pub fn new(endpoint: impl Into<String>, secret: Option<String>) -> reqwest::Result<Self> {
            let http = reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(3))
                .timeout(std::time::Duration::from_secs(10))
                .build()?;
            Ok(Self {
                http,
                endpoint: endpoint.into(),
                secret,
            })
        }

        async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
            let mut all_params = Vec::with_capacity(params.len() + 1);
            if let Some(secret) = &self.secret {
                all_params.push(json!(format!("token:{secret}")));
            }
            all_params.extend(params);

            let body = json!({
                "jsonrpc": "2.0",
                "id": "grabbox",
                "method": method,
                "params": all_params,
            });

            let response = self
                .http
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await
                .map_err(|e| CoreError::Network(format!("aria2 rpc {method}: {e}")))?;
            let payload: Value = response
                .json()
                .await
                .map_err(|e| CoreError::Network(format!("aria2 rpc {method}: {e}")))?;

            if let Some(error) = payload.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown rpc error");
                return Err(CoreError::Network(format!("aria2 rpc {method}: {message}")));
            }
            payload
                .get("result")
                .cloned()
                .ok_or_else(|| CoreError::Network(format!("aria2 rpc {method}: missing result")))
        }
    }

    impl Aria2Api for Aria2Rpc {
        async fn add_uri(&self, uris: Vec<String>, options: Value) -> Result<String> {
            let result = self.call("aria2.addUri", vec![json!(uris), options]).await?;
            result
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| CoreError::Network("addUri returned a non-string gid".to_string()))
        }

        async fn tell_status(&self, gid: &str) -> Result<Aria2Status> {
            let result = self.call("aria2.tellStatus", vec![json!(gid)]).await?;
            Aria2Status::from_value(result)
        }

        async fn remove(&self, gid: &str) -> Result<()> {
            self.call("aria2.remove", vec![json!(gid)]).await?;
            Ok(())
        }

        async fn get_version(&self) -> Result<String> {
            let result = self
                .call("aria2.getVersion", Vec::new())
                .await
                .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;
            Ok(result
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string())
        }
    }
}

#[cfg(feature = "reqwest")]
pub use rpc::Aria2Rpc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineParams;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockAria2 {
        added: Mutex<Vec<(Vec<String>, Value)>>,
        removed: Mutex<Vec<String>>,
        status: Mutex<Aria2Status>,
    }

    impl Aria2Api for MockAria2 {
        async fn add_uri(&self, uris: Vec<String>, options: Value) -> Result<String> {
            self.added.lock().unwrap().push((uris, options));
            Ok("gid-1".to_string())
        }

        async fn tell_status(&self, _gid: &str) -> Result<Aria2Status> {
            Ok(self.status.lock().unwrap().clone())
        }

        async fn remove(&self, gid: &str) -> Result<()> {
            self.removed.lock().unwrap().push(gid.to_string());
            Ok(())
        }

        async fn get_version(&self) -> Result<String> {
            Ok("1.37.0".to_string())
        }
    }

    fn task() -> DownloadTask {
        let mut t = DownloadTask::new(
            "7".into(),
            "big.iso".into(),
            1_000,
            PathBuf::from("/downloads/big.iso"),
        );
        t.cookie = Some("ndus=xyz".into());
        t
    }

    #[tokio::test]
    async fn start_maps_session_params_onto_options() {
        let engine = Aria2Engine::new(MockAria2::default(), "agent/1.0");
        let session = TransferSession::new("http://m/file".into(), EngineParams::default());

        let handle = engine.start(&task(), &session).await.unwrap();
        assert_eq!(handle.id(), "gid-1");

        let added = engine.api().added.lock().unwrap();
        let (uris, options) = &added[0];
        assert_eq!(uris, &["http://m/file"]);
        assert_eq!(options["dir"], "/downloads");
        assert_eq!(options["out"], "big.iso");
        assert_eq!(options["max-connection-per-server"], "16");
        assert_eq!(options["split"], "16");
        assert_eq!(options["min-split-size"], "1048576");
        assert_eq!(options["stream-piece-selector"], "inorder");
        assert_eq!(options["continue"], "true");
        assert_eq!(options["max-download-limit"], "0");

        let headers: Vec<&str> = options["header"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(headers.contains(&"Cookie: ndus=xyz"));
    }

    #[tokio::test]
    async fn escalated_params_change_the_option_map() {
        let engine = Aria2Engine::new(MockAria2::default(), "agent/1.0");
        let session = TransferSession::new(
            "http://m/file".into(),
            EngineParams::default().degraded(),
        );

        engine.start(&task(), &session).await.unwrap();

        let added = engine.api().added.lock().unwrap();
        let (_, options) = &added[0];
        assert_eq!(options["max-connection-per-server"], "8");
        assert_eq!(options["split"], "8");
        assert_eq!(options["min-split-size"], "2097152");
        assert_eq!(options["stream-piece-selector"], "random");
    }

    #[tokio::test]
    async fn poll_maps_status_fields() {
        let engine = Aria2Engine::new(MockAria2::default(), "agent/1.0");
        *engine.api().status.lock().unwrap() = Aria2Status {
            status: "active".into(),
            completed_length: 123,
            total_length: 1_000,
            download_speed: 456,
            ..Aria2Status::default()
        };

        let status = engine.poll(&EngineHandle("gid-1".into())).await.unwrap();
        assert!(status.is_active);
        assert!(!status.is_complete);
        assert_eq!(status.completed_bytes, 123);
        assert_eq!(status.speed_bps, 456);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn poll_surfaces_engine_errors() {
        let engine = Aria2Engine::new(MockAria2::default(), "agent/1.0");
        *engine.api().status.lock().unwrap() = Aria2Status {
            status: "error".into(),
            error_code: Some("19".into()),
            error_message: Some("name resolution failed".into()),
            ..Aria2Status::default()
        };

        let status = engine.poll(&EngineHandle("gid-1".into())).await.unwrap();
        assert!(!status.is_active);
        assert_eq!(status.error.as_deref(), Some("name resolution failed"));
    }

    #[tokio::test]
    async fn cancel_releases_the_gid() {
        let engine = Aria2Engine::new(MockAria2::default(), "agent/1.0");
        engine.cancel(&EngineHandle("gid-9".into())).await.unwrap();
        assert_eq!(*engine.api().removed.lock().unwrap(), vec!["gid-9"]);
    }

    #[test]
    fn tell_status_reply_parses_stringly_typed_numbers() {
        let value = json!({
            "status": "complete",
            "completedLength": "1000000",
            "totalLength": "1000000",
            "downloadSpeed": "0"
        });
        let status = Aria2Status::from_value(value).unwrap();
        assert_eq!(status.status, "complete");
        assert_eq!(status.completed_length, 1_000_000);
        assert_eq!(status.total_length, 1_000_000);
    }
}
