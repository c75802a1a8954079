//! Process-wide link and stream registry
//!
//! Two independent tables behind separate mutexes: one maps a [`ServerId`]
//! to its live [`Link`], the other maps a local stream id to its owning
//! server and the client's send handle. The locks guard pure map work only
//! and are never held across an await; the send handle is an unbounded
//! channel sender, so delivering under the lock performs no I/O.

use crate::link::Link;
use bytes::Bytes;
use hostlink_proto::ServerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Command for the per-client writer task that owns the client socket's
/// write half.
#[derive(Debug)]
pub enum StreamCommand {
    /// Write these bytes to the client.
    Data(Bytes),
    /// Close the client socket for writing.
    Shutdown,
}

/// Send handle of one proxied client connection.
pub type StreamSender = mpsc::UnboundedSender<StreamCommand>;

struct StreamEntry {
    owner: ServerId,
    sender: StreamSender,
}

/// Shared state of the relay, explicitly constructed and handed to both
/// accept loops. Lives for the duration of the process.
#[derive(Default)]
pub struct Registry {
    links: Mutex<HashMap<ServerId, Arc<Link>>>,
    streams: Mutex<HashMap<u64, StreamEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a link under its handshaken id. Returns false without
    /// mutating when another link already holds the id; the caller retries
    /// for the registration grace window to let a dying predecessor finish
    /// deregistering.
    pub fn add_link(&self, link: &Arc<Link>) -> bool {
        let mut links = self.links.lock().unwrap();
        if links.contains_key(&link.id()) {
            return false;
        }
        links.insert(link.id(), link.clone());
        true
    }

    /// Remove a link, but only if the stored entry is this very instance; a
    /// reconnect may already have replaced it with a fresh link.
    pub fn remove_link(&self, link: &Arc<Link>) {
        let mut links = self.links.lock().unwrap();
        if let Some(stored) = links.get(&link.id()) {
            if Arc::ptr_eq(stored, link) {
                links.remove(&link.id());
            }
        }
    }

    pub fn get_link(&self, id: ServerId) -> Option<Arc<Link>> {
        self.links.lock().unwrap().get(&id).cloned()
    }

    /// Number of registered links. Diagnostic only.
    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Register a proxied client stream under the server that owns it.
    pub fn add_stream(&self, stream_id: u64, owner: ServerId, sender: StreamSender) {
        self.streams
            .lock()
            .unwrap()
            .insert(stream_id, StreamEntry { owner, sender });
    }

    pub fn remove_stream(&self, stream_id: u64) {
        self.streams.lock().unwrap().remove(&stream_id);
    }

    /// Run `f` on the stream's send handle while holding the table lock, so
    /// lookup-then-use is atomic with respect to concurrent removal. Runs
    /// only when `caller` is the server that owns the stream; a stale or
    /// foreign id is a no-op. Returns whether `f` ran.
    pub fn with_stream<F>(&self, stream_id: u64, caller: ServerId, f: F) -> bool
    where
        F: FnOnce(&StreamSender),
    {
        let streams = self.streams.lock().unwrap();
        match streams.get(&stream_id) {
            Some(entry) if entry.owner == caller => {
                f(&entry.sender);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn handshaken_link(id: u64) -> Arc<Link> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (mut far, _) = accepted.unwrap();
        far.write_all(&id.to_be_bytes()).await.unwrap();
        let link = Arc::new(Link::new(client.unwrap()));
        link.handshake().await.unwrap();
        link
    }

    #[tokio::test]
    async fn test_add_link_rejects_duplicate_id() {
        let registry = Registry::new();
        let first = handshaken_link(7).await;
        let second = handshaken_link(7).await;

        assert!(registry.add_link(&first));
        assert!(!registry.add_link(&second));
        assert_eq!(registry.link_count(), 1);
        // The original registration is untouched.
        assert!(Arc::ptr_eq(
            &registry.get_link(ServerId::new(7)).unwrap(),
            &first
        ));
    }

    #[tokio::test]
    async fn test_remove_link_only_removes_same_instance() {
        let registry = Registry::new();
        let old = handshaken_link(9).await;
        let new = handshaken_link(9).await;

        assert!(registry.add_link(&old));
        registry.remove_link(&old);
        assert!(registry.add_link(&new));

        // The old link's cleanup running late must not evict its successor.
        registry.remove_link(&old);
        assert!(Arc::ptr_eq(
            &registry.get_link(ServerId::new(9)).unwrap(),
            &new
        ));

        registry.remove_link(&new);
        assert!(registry.get_link(ServerId::new(9)).is_none());
        assert_eq!(registry.link_count(), 0);
    }

    #[tokio::test]
    async fn test_with_stream_requires_matching_owner() {
        let registry = Registry::new();
        let owner = ServerId::new(1);
        let foreign = ServerId::new(2);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        registry.add_stream(40, owner, sender);

        let delivered = registry.with_stream(40, foreign, |sender| {
            let _ = sender.send(StreamCommand::Shutdown);
        });
        assert!(!delivered);
        assert!(receiver.try_recv().is_err());

        let delivered = registry.with_stream(40, owner, |sender| {
            let _ = sender.send(StreamCommand::Data(Bytes::from_static(b"ok")));
        });
        assert!(delivered);
        assert!(matches!(
            receiver.try_recv(),
            Ok(StreamCommand::Data(data)) if data.as_ref() == b"ok"
        ));
    }

    #[tokio::test]
    async fn test_with_stream_after_removal_is_noop() {
        let registry = Registry::new();
        let owner = ServerId::new(3);
        let (sender, _receiver) = mpsc::unbounded_channel();
        registry.add_stream(5, owner, sender);
        registry.remove_stream(5);

        assert!(!registry.with_stream(5, owner, |_| panic!("must not run")));
    }
}
