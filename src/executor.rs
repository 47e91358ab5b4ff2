//! The seam to the external build-graph executor.
//!
//! The executor is lazy and content-addressed: it only runs what the
//! requested node transitively depends on, and may reuse any result it has
//! seen before. Nothing in this crate implements one.

use crate::graph::{Graph, NodeId};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

/// Read access to an evaluated filesystem.
///
/// Paths are absolute paths inside that filesystem.
pub trait FsView: Send + Sync {
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Entry names of a directory, in any order.
    fn read_dir(&self, path: &str) -> io::Result<Vec<String>>;
}

/// The executor failed to produce a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BuildError {
    /// The node whose evaluation failed, when the executor can tell.
    pub node: Option<NodeId>,
    /// Exit status of a failed process.
    pub exit_code: Option<i32>,
    pub message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            node: None,
            exit_code: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Evaluate `node` and everything it depends on.
    async fn evaluate(&self, graph: &Graph, node: NodeId) -> Result<Arc<dyn FsView>, BuildError>;
}

/// Cooperative cancellation shared by every task of a test run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn build_error_builders() {
        let mut graph = Graph::new();
        let node = graph.source("x");
        let err = BuildError::new("exit status 1").at(node).with_exit_code(1);
        assert_eq!(err.node, Some(node));
        assert_eq!(err.exit_code, Some(1));
        assert_eq!(err.to_string(), "exit status 1");
    }
}
