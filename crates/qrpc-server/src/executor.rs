//! Work execution behind the consumers.
//!
//! A consumer hands each decoded task string to a [`WorkExecutor`] and maps
//! its failures onto the synthetic reply statuses: a timed-out backend is a
//! 504, a reset is a 503, and a rebuildable fault earns exactly one retry
//! before the 503.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use qrpc_common::Reply;

/// How a unit of work can fail, from the consumer's point of view.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The backend did not answer within its deadline.
    #[error("backend timed out")]
    Timeout,
    /// The backend refused or dropped the request; not worth retrying.
    #[error("backend reset: {0}")]
    Reset(String),
    /// Transient infrastructure fault; the work may succeed if retried
    /// after the backend is re-established.
    #[error("backend needs rebuild: {0}")]
    Rebuild(String),
}

/// Executes one task and produces the reply to ship back to the caller.
#[async_trait]
pub trait WorkExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &str) -> Result<Reply, ExecError>;
}

/// Fetches `base_url + task` over HTTP/1.1 and returns the response as the
/// reply, with hop-by-hop headers stripped.
pub struct HttpExecutor {
    client: Client<HttpConnector, Empty<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(5))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url,
            timeout,
        }
    }

    fn task_url(&self, task: &str) -> String {
        if task.starts_with('/') {
            format!("{}{}", self.base_url, task)
        } else {
            format!("{}/{}", self.base_url, task)
        }
    }
}

#[async_trait]
impl WorkExecutor for HttpExecutor {
    async fn execute(&self, task: &str) -> Result<Reply, ExecError> {
        let url = self.task_url(task);
        let request = Request::get(url.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| ExecError::Reset(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ExecError::Timeout)?
            .map_err(|e| {
                if e.is_connect() {
                    ExecError::Rebuild(e.to_string())
                } else {
                    ExecError::Reset(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ExecError::Reset(e.to_string()))?
            .to_bytes()
            .to_vec();

        Ok(Reply::new(status, body, headers).without_hop_headers())
    }
}
