//! Remote node agent client.
//!
//! Every provisioned node runs an agent answering three calls over
//! HTTP/1.1 with JSON bodies:
//!
//! | Call        | Request              | Response        |
//! |-------------|----------------------|-----------------|
//! | health      | `GET /healthcheck`   | any 2xx         |
//! | peer info   | `GET /peerinfo`      | [`PeerInfo`]    |
//! | run task    | `POST /run` + `Task` | [`TaskOutcome`] |
//!
//! Every failure of the exchange itself (connect, timeout, non-2xx,
//! undecodable body) is reported as `Unavailable`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use peerlab_core::{BoxFuture, LabError, LabResult, cancellable};
use peerlab_state::{Node, Task, TransferStats};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A node's p2p identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    /// Transport addresses, e.g. `/ip4/10.0.0.1/tcp/4001`.
    pub addrs: Vec<String>,
}

impl PeerInfo {
    /// `{addr}/p2p/{id}` built from the first advertised address.
    pub fn peer_address(&self) -> Option<String> {
        self.addrs
            .first()
            .map(|addr| format!("{addr}/p2p/{}", self.id))
    }
}

/// What an agent reports after running a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    #[serde(default)]
    pub stats: TransferStats,
}

/// Handle to one node's agent.
pub trait NodeAgent: Send + Sync {
    fn node_id(&self) -> &str;

    fn health<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, LabResult<()>>;

    fn peer_info<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, LabResult<PeerInfo>>;

    fn run_task<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        task: &'a Task,
    ) -> BoxFuture<'a, LabResult<TaskOutcome>>;
}

/// Builds agent handles for persisted nodes.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Arc<dyn NodeAgent>;
}

/// Connector speaking HTTP/1.1 to `{address}:{agent_port}`.
#[derive(Debug, Clone)]
pub struct HttpAgentConnector {
    timeout: Duration,
}

impl HttpAgentConnector {
    /// `timeout` bounds each request, including connection setup.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpAgentConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl AgentConnector for HttpAgentConnector {
    fn connect(&self, node: &Node) -> Arc<dyn NodeAgent> {
        Arc::new(HttpAgent {
            node_id: node.id.clone(),
            authority: format!("{}:{}", node.address, node.agent_port),
            timeout: self.timeout,
        })
    }
}

struct HttpAgent {
    node_id: String,
    authority: String,
    timeout: Duration,
}

impl HttpAgent {
    fn unavailable(&self, path: &str, err: impl fmt::Display) -> LabError {
        LabError::Unavailable(format!("node {} {path}: {err}", self.node_id))
    }

    async fn exchange(&self, method: Method, path: &str, body: Bytes) -> LabResult<Bytes> {
        let stream = TcpStream::connect(&self.authority)
            .await
            .map_err(|e| self.unavailable(path, e))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| self.unavailable(path, e))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "agent connection closed");
            }
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, &self.authority)
            .header(USER_AGENT, "peerlab/0.1")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| LabError::Internal(format!("build request {path}: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| self.unavailable(path, e))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| self.unavailable(path, e))?
            .to_bytes();

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&bytes);
            return Err(self.unavailable(path, format!("status {status}: {detail}")));
        }
        Ok(bytes)
    }

    async fn call(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> LabResult<Bytes> {
        debug!(node_id = %self.node_id, %method, path, "agent call");
        let timed = async {
            tokio::time::timeout(self.timeout, self.exchange(method, path, body))
                .await
                .map_err(|_| self.unavailable(path, "timed out"))?
        };
        cancellable(cancel, timed).await
    }

    fn decode<T: DeserializeOwned>(&self, path: &str, bytes: &[u8]) -> LabResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| self.unavailable(path, format!("malformed response: {e}")))
    }
}

impl NodeAgent for HttpAgent {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn health<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, LabResult<()>> {
        Box::pin(async move {
            self.call(cancel, Method::GET, "/healthcheck", Bytes::new())
                .await
                .map(|_| ())
        })
    }

    fn peer_info<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, LabResult<PeerInfo>> {
        Box::pin(async move {
            let bytes = self
                .call(cancel, Method::GET, "/peerinfo", Bytes::new())
                .await?;
            self.decode("/peerinfo", &bytes)
        })
    }

    fn run_task<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        task: &'a Task,
    ) -> BoxFuture<'a, LabResult<TaskOutcome>> {
        Box::pin(async move {
            let body = serde_json::to_vec(task)
                .map_err(|e| LabError::Internal(format!("encode task: {e}")))?;
            let bytes = self
                .call(cancel, Method::POST, "/run", Bytes::from(body))
                .await?;
            self.decode("/run", &bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlab_core::ErrorKind;
    use peerlab_state::NodeDescriptor;

    #[test]
    fn peer_address_uses_first_addr() {
        let info = PeerInfo {
            id: "QmPeer".into(),
            addrs: vec!["/ip4/10.0.0.1/tcp/4001".into(), "/ip4/10.0.0.2/tcp/4001".into()],
        };
        assert_eq!(
            info.peer_address().as_deref(),
            Some("/ip4/10.0.0.1/tcp/4001/p2p/QmPeer")
        );
        let empty = PeerInfo {
            id: "QmPeer".into(),
            addrs: vec![],
        };
        assert!(empty.peer_address().is_none());
    }

    #[tokio::test]
    async fn unreachable_agent_is_unavailable() {
        // Bind then drop a listener to find a port nobody is serving.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let node = Node::from_descriptor(
            "c1",
            &NodeDescriptor {
                id: "n1".into(),
                address: "127.0.0.1".into(),
                agent_port: port,
                labels: vec![],
            },
        );
        let agent = HttpAgentConnector::new(Duration::from_secs(2)).connect(&node);
        let err = agent.health(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.to_string().contains("node n1"));
    }
}
