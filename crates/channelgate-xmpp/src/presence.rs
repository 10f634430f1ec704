//! Reference-counted presence for one session.
//!
//! Two independent counts: the session-wide one toggled by
//! `send_presence_online/offline`, and one per remote server that
//! subscriptions hold while they need the server to see us as available.
//! A count and the presence stanza it triggers change under the same lock,
//! so concurrent callers never send a duplicate or miss a transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use jid::BareJid;
use minidom::Element;
use tokio::sync::mpsc;
use tracing::debug;

use crate::stanza;

#[derive(Debug, Default)]
struct Counts {
    online: usize,
    servers: HashMap<BareJid, usize>,
}

pub struct PresenceTracker {
    outbound: mpsc::UnboundedSender<Element>,
    counts: Mutex<Counts>,
}

impl PresenceTracker {
    pub fn new(outbound: mpsc::UnboundedSender<Element>) -> Self {
        Self {
            outbound,
            counts: Mutex::new(Counts::default()),
        }
    }

    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, to: Option<&BareJid>, available: bool) {
        debug!(to = ?to, available, "Sending presence");
        // A closed connection has no presence left to change.
        let _ = self.outbound.send(stanza::presence(to, available));
    }

    /// Increment the session-wide count; the first holder broadcasts
    /// available presence. Returns whether presence was sent.
    pub fn online(&self) -> bool {
        let mut counts = self.counts();
        counts.online += 1;
        let first = counts.online == 1;
        if first {
            self.send(None, true);
        }
        first
    }

    /// Decrement the session-wide count; the last holder broadcasts
    /// unavailable presence. Unbalanced calls are ignored.
    pub fn offline(&self) -> bool {
        let mut counts = self.counts();
        if counts.online == 0 {
            return false;
        }
        counts.online -= 1;
        let last = counts.online == 0;
        if last {
            self.send(None, false);
        }
        last
    }

    /// Take a reference on `server`, sending directed presence for the first.
    pub fn acquire(&self, server: &BareJid) -> bool {
        let mut counts = self.counts();
        let count = counts.servers.entry(server.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        if first {
            self.send(Some(server), true);
        }
        first
    }

    /// Drop a reference on `server`, sending directed unavailable presence
    /// when none remain.
    pub fn release(&self, server: &BareJid) -> bool {
        let mut counts = self.counts();
        let Some(count) = counts.servers.get_mut(server) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        counts.servers.remove(server);
        self.send(Some(server), false);
        true
    }

    pub fn server_count(&self, server: &BareJid) -> usize {
        self.counts().servers.get(server).copied().unwrap_or(0)
    }

    pub fn online_count(&self) -> usize {
        self.counts().online
    }
}
