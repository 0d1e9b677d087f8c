//! Transport seam and the in-process mesh.
//!
//! The runtime core only needs a transport that delivers opaque short
//! payloads in FIFO per-sender order, at least once. [`Transport`] is
//! that seam; [`MeshTransport`] is the in-process implementation wiring
//! the nodes of one process together with per-node inboxes.

use crate::types::NodeId;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a transport.
///
/// Any of these is unrecoverable for the runtime and escalates to an
/// abnormal shutdown.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target node is not part of this transport.
    #[error("unknown target node {0}")]
    UnknownTarget(NodeId),

    /// The target node has detached (already shut down).
    #[error("target node {0} is detached")]
    Detached(NodeId),
}

/// Delivers typed short messages between nodes.
///
/// Implementations must preserve per-sender FIFO order on every link
/// and may deliver a payload more than once; the dispatch layer
/// deduplicates.
pub trait Transport: Send + Sync + 'static {
    /// Number of nodes reachable through this transport.
    fn node_count(&self) -> usize;

    /// Enqueues a payload for `target`.
    fn send(&self, target: NodeId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Blocks up to `timeout` for the next payload addressed to `node`.
    fn recv_timeout(&self, node: NodeId, timeout: Duration) -> Option<Vec<u8>>;

    /// Returns true if payloads are queued for `node`.
    fn has_pending(&self, node: NodeId) -> bool;

    /// Marks `node` as gone; subsequent sends to it fail.
    fn detach(&self, node: NodeId);
}

struct Inbox {
    queue: SegQueue<Vec<u8>>,
    lock: Mutex<()>,
    cvar: Condvar,
    attached: AtomicBool,
}

impl Inbox {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            attached: AtomicBool::new(true),
        }
    }
}

/// In-process mesh: one FIFO inbox per node.
pub struct MeshTransport {
    inboxes: Vec<Inbox>,
}

impl MeshTransport {
    /// Creates a mesh connecting `nodes` nodes.
    #[must_use]
    pub fn new(nodes: usize) -> Self {
        Self {
            inboxes: (0..nodes).map(|_| Inbox::new()).collect(),
        }
    }

    fn inbox(&self, node: NodeId) -> Option<&Inbox> {
        self.inboxes.get(node.as_usize())
    }
}

impl std::fmt::Debug for MeshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshTransport")
            .field("nodes", &self.inboxes.len())
            .finish()
    }
}

impl Transport for MeshTransport {
    fn node_count(&self) -> usize {
        self.inboxes.len()
    }

    fn send(&self, target: NodeId, payload: Vec<u8>) -> Result<(), TransportError> {
        let inbox = self
            .inbox(target)
            .ok_or(TransportError::UnknownTarget(target))?;
        if !inbox.attached.load(Ordering::Acquire) {
            return Err(TransportError::Detached(target));
        }
        inbox.queue.push(payload);
        // Notify under the lock so a receiver between its empty check
        // and its wait cannot miss the wakeup.
        let _guard = inbox.lock.lock().expect("inbox lock poisoned");
        inbox.cvar.notify_one();
        Ok(())
    }

    fn recv_timeout(&self, node: NodeId, timeout: Duration) -> Option<Vec<u8>> {
        let inbox = self.inbox(node)?;
        if let Some(payload) = inbox.queue.pop() {
            return Some(payload);
        }
        let guard = inbox.lock.lock().expect("inbox lock poisoned");
        if let Some(payload) = inbox.queue.pop() {
            return Some(payload);
        }
        let (guard, _) = inbox
            .cvar
            .wait_timeout(guard, timeout)
            .expect("inbox lock poisoned");
        drop(guard);
        inbox.queue.pop()
    }

    fn has_pending(&self, node: NodeId) -> bool {
        self.inbox(node).is_some_and(|inbox| !inbox.queue.is_empty())
    }

    fn detach(&self, node: NodeId) {
        if let Some(inbox) = self.inbox(node) {
            inbox.attached.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_fifo_order() {
        let mesh = MeshTransport::new(2);
        mesh.send(NodeId(1), vec![1]).expect("send failed");
        mesh.send(NodeId(1), vec![2]).expect("send failed");
        mesh.send(NodeId(1), vec![3]).expect("send failed");
        assert_eq!(mesh.recv_timeout(NodeId(1), Duration::from_millis(10)), Some(vec![1]));
        assert_eq!(mesh.recv_timeout(NodeId(1), Duration::from_millis(10)), Some(vec![2]));
        assert_eq!(mesh.recv_timeout(NodeId(1), Duration::from_millis(10)), Some(vec![3]));
    }

    #[test]
    fn recv_times_out_when_empty() {
        let mesh = MeshTransport::new(1);
        assert_eq!(mesh.recv_timeout(NodeId(0), Duration::from_millis(5)), None);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let mesh = MeshTransport::new(1);
        let err = mesh.send(NodeId(7), vec![0]).expect_err("expected err");
        assert!(matches!(err, TransportError::UnknownTarget(NodeId(7))));
    }

    #[test]
    fn detached_target_is_rejected() {
        let mesh = MeshTransport::new(2);
        mesh.detach(NodeId(1));
        let err = mesh.send(NodeId(1), vec![0]).expect_err("expected err");
        assert!(matches!(err, TransportError::Detached(NodeId(1))));
    }

    #[test]
    fn pending_reflects_queue_state() {
        let mesh = MeshTransport::new(1);
        assert!(!mesh.has_pending(NodeId(0)));
        mesh.send(NodeId(0), vec![9]).expect("send failed");
        assert!(mesh.has_pending(NodeId(0)));
        let _ = mesh.recv_timeout(NodeId(0), Duration::from_millis(10));
        assert!(!mesh.has_pending(NodeId(0)));
    }

    #[test]
    fn cross_thread_wakeup() {
        use std::sync::Arc;
        let mesh = Arc::new(MeshTransport::new(1));
        let sender = Arc::clone(&mesh);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send(NodeId(0), vec![42]).expect("send failed");
        });
        let got = mesh.recv_timeout(NodeId(0), Duration::from_secs(2));
        handle.join().expect("sender thread failed");
        assert_eq!(got, Some(vec![42]));
    }
}
