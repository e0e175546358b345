//! The in-process transport registry.
//!
//! Same-host peers inside the local range skip TCP entirely: their
//! chatterboxes register inbound channel senders here under the in-process
//! transport string, and requesters and subscribers look them up. One
//! exchange exists per [ProcessCtx](crate::ctx::ProcessCtx), so clusters in
//! the same test binary stay isolated.

use super::Replier;
use bytes::Bytes;
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One subscriber registered with a publisher: its filter set and the
/// channel publications are delivered on.
#[derive(Debug)]
pub struct Subscriber {
    /// Unique id, used for removal.
    pub id: u64,
    /// Leading-byte filters; a message is delivered if any filter is a
    /// prefix of it. An empty set receives nothing.
    pub filters: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Delivery channel.
    pub tx: Sender<Bytes>,
}

/// A publisher's live subscriber list.
#[derive(Debug, Default)]
pub struct PubState {
    subs: Mutex<Vec<Subscriber>>,
}

impl PubState {
    /// Register a subscriber.
    pub fn add_subscriber(&self, sub: Subscriber) {
        self.subs.lock().expect("poisoned subs").push(sub);
    }

    /// Remove a subscriber by id.
    pub fn remove_subscriber(&self, id: u64) {
        self.subs.lock().expect("poisoned subs").retain(|s| s.id != id);
    }

    /// Fan a message out to every matching subscriber, pruning any whose
    /// channel has gone away.
    pub fn publish(&self, data: &Bytes) {
        let mut subs = self.subs.lock().expect("poisoned subs");
        subs.retain(|s| {
            let matched = s
                .filters
                .lock()
                .expect("poisoned filters")
                .iter()
                .any(|f| data.starts_with(f));
            if !matched {
                return true;
            }
            s.tx.send(data.clone()).is_ok()
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().expect("poisoned subs").len()
    }
}

/// The per-process registry of bound in-process sockets.
#[derive(Debug, Default)]
pub struct Exchange {
    reqs: Mutex<HashMap<String, Sender<(Bytes, Replier)>>>,
    pulls: Mutex<HashMap<String, Sender<Bytes>>>,
    pubs: Mutex<HashMap<String, Arc<PubState>>>,
}

impl Exchange {
    /// Bind a reply socket at `key`.
    pub fn register_req(&self, key: String, tx: Sender<(Bytes, Replier)>) {
        self.reqs.lock().expect("poisoned reqs").insert(key, tx);
    }

    /// Bind a pull socket at `key`.
    pub fn register_pull(&self, key: String, tx: Sender<Bytes>) {
        self.pulls.lock().expect("poisoned pulls").insert(key, tx);
    }

    /// Bind a publish socket at `key`.
    pub fn register_pub(&self, key: String, state: Arc<PubState>) {
        self.pubs.lock().expect("poisoned pubs").insert(key, state);
    }

    /// Look up a reply socket.
    pub fn lookup_req(&self, key: &str) -> Option<Sender<(Bytes, Replier)>> {
        self.reqs.lock().expect("poisoned reqs").get(key).cloned()
    }

    /// Look up a pull socket.
    pub fn lookup_pull(&self, key: &str) -> Option<Sender<Bytes>> {
        self.pulls.lock().expect("poisoned pulls").get(key).cloned()
    }

    /// Look up a publish socket.
    pub fn lookup_pub(&self, key: &str) -> Option<Arc<PubState>> {
        self.pubs.lock().expect("poisoned pubs").get(key).cloned()
    }

    /// Unbind a reply socket.
    pub fn unregister_req(&self, key: &str) {
        self.reqs.lock().expect("poisoned reqs").remove(key);
    }

    /// Unbind a pull socket.
    pub fn unregister_pull(&self, key: &str) {
        self.pulls.lock().expect("poisoned pulls").remove(key);
    }

    /// Unbind a publish socket.
    pub fn unregister_pub(&self, key: &str) {
        self.pubs.lock().expect("poisoned pubs").remove(key);
    }
}
