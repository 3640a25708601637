//! Pending-reply tables, one bucket per remote peer.
//!
//! Replies are keyed by `(remote unique name, outgoing serial)`. An entry
//! is removed *before* its callback runs, so a callback may re-register
//! the same serial, and a second explicit removal is a no-op.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::trace;

use crate::connection::{run_proxied, run_release, Connection, ProxyPair, ReleaseHook};
use crate::error::*;
use crate::message::{Message, MessageType};

pub type ReplyCallback = Box<dyn FnOnce(&mut Connection, &Message)>;

/// Registration for the reply to an outgoing method call.
///
/// `remote` is the destination the call is sent to; a well-known name is
/// resolved to the owning unique name during registration, since replies
/// are matched by sender unique name.
pub struct Reply {
    pub remote: String,
    pub serial: u32,
    pub(crate) on_reply: Option<ReplyCallback>,
    pub(crate) on_error: Option<ReplyCallback>,
    pub(crate) release: [Option<ReleaseHook>; 2],
    pub(crate) proxy: Option<ProxyPair>,
}

impl Reply {
    pub fn new(remote: impl Into<String>, serial: u32) -> Reply {
        Reply {
            remote: remote.into(),
            serial,
            on_reply: None,
            on_error: None,
            release: [None, None],
            proxy: None,
        }
    }

    pub fn on_reply(mut self, f: impl FnOnce(&mut Connection, &Message) + 'static) -> Self {
        self.on_reply = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&mut Connection, &Message) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Hook run exactly once when the registration is released, whether by
    /// delivery, explicit removal or connection teardown. Two slots exist;
    /// further hooks are ignored.
    pub fn on_release(mut self, f: impl FnOnce() + 'static) -> Self {
        let slot = self.release.iter_mut().find(|s| s.is_none());
        debug_assert!(slot.is_some(), "both release slots already taken");
        if let Some(slot) = slot {
            *slot = Some(Box::new(f));
        }
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyPair) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub(crate) fn into_parts(self) -> (String, u32, ReplyEntry) {
        (
            self.remote,
            self.serial,
            ReplyEntry {
                on_reply: self.on_reply,
                on_error: self.on_error,
                release: self.release,
                proxy: self.proxy,
            },
        )
    }
}

/// Handle for explicit removal; removal after delivery is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHandle {
    pub(crate) remote: String,
    pub(crate) serial: u32,
}

pub(crate) struct ReplyEntry {
    pub(crate) on_reply: Option<ReplyCallback>,
    pub(crate) on_error: Option<ReplyCallback>,
    pub(crate) release: [Option<ReleaseHook>; 2],
    pub(crate) proxy: Option<ProxyPair>,
}

impl ReplyEntry {
    /// Runs the success or error callback for `msg`, then the release
    /// hooks. The entry has already left the table at this point.
    pub(crate) fn deliver(self, conn: &mut Connection, msg: &Message) {
        let ReplyEntry {
            on_reply,
            on_error,
            release,
            proxy,
        } = self;
        let callback = match msg.message_type {
            MessageType::MethodReturn => on_reply,
            MessageType::Error => on_error,
            _ => None,
        };
        if let Some(callback) = callback {
            run_proxied(proxy.as_ref(), || callback(conn, msg));
        }
        for hook in release {
            if let Some(hook) = hook {
                run_release(proxy.as_ref(), hook);
            }
        }
    }

    /// Runs only the release hooks (explicit removal).
    pub(crate) fn discard(self) {
        for hook in self.release {
            if let Some(hook) = hook {
                run_release(self.proxy.as_ref(), hook);
            }
        }
    }
}

/// Two-level map: unique name, then serial. A remote bucket exists exactly
/// while it has pending replies.
#[derive(Default)]
pub(crate) struct ReplyRegistry {
    remotes: HashMap<String, HashMap<u32, ReplyEntry>>,
}

impl ReplyRegistry {
    pub(crate) fn insert(&mut self, remote: &str, serial: u32, entry: ReplyEntry) -> Result<()> {
        let bucket = self.remotes.entry(remote.to_string()).or_default();
        match bucket.entry(serial) {
            Entry::Occupied(_) => Err(context!(ErrorKind::ReplyCollision(
                remote.to_string(),
                serial
            ))),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                trace!("add reply {} serial {}", remote, serial);
                Ok(())
            }
        }
    }

    pub(crate) fn take(&mut self, remote: &str, serial: u32) -> Option<ReplyEntry> {
        let bucket = self.remotes.get_mut(remote)?;
        let entry = bucket.remove(&serial);
        if bucket.is_empty() {
            self.remotes.remove(remote);
        }
        if entry.is_some() {
            trace!("remove reply {} serial {}", remote, serial);
        }
        entry
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, u32, ReplyEntry)> {
        std::mem::take(&mut self.remotes)
            .into_iter()
            .flat_map(|(name, bucket)| {
                bucket
                    .into_iter()
                    .map(move |(serial, entry)| (name.clone(), serial, entry))
            })
            .collect()
    }

    pub(crate) fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}
