//! Subscription table for signals and arbitrary broadcasts.
//!
//! Every inbound message is offered to every registered match; a match
//! fires when all of its present fields equal the corresponding message
//! fields. Dispatch iterates an insertion-order snapshot, so callbacks are
//! free to add or remove matches while dispatch is running.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::trace;

use crate::connection::{Connection, ProxyPair, ReleaseHook};
use crate::message::{Message, MessageType};

pub type MatchCallback = Rc<RefCell<dyn FnMut(&mut Connection, &Message)>>;

/// A match registration: a conjunction of equality predicates plus the
/// callback to fire. Fill in the predicate fields directly or through the
/// `with_*` helpers; absent fields match anything.
pub struct Match {
    pub message_type: Option<MessageType>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    /// Equality predicates over string-typed arguments, by index.
    pub arguments: Vec<(usize, String)>,
    pub(crate) callback: MatchCallback,
    pub(crate) release: Option<ReleaseHook>,
    pub(crate) proxy: Option<ProxyPair>,
}

impl Match {
    pub fn new(callback: impl FnMut(&mut Connection, &Message) + 'static) -> Match {
        Match {
            message_type: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            arguments: Vec::new(),
            callback: Rc::new(RefCell::new(callback)),
            release: None,
            proxy: None,
        }
    }

    pub fn with_message_type(mut self, t: MessageType) -> Self {
        self.message_type = Some(t);
        self
    }

    pub fn with_sender(mut self, v: &str) -> Self {
        self.sender = Some(v.to_string());
        self
    }

    pub fn with_destination(mut self, v: &str) -> Self {
        self.destination = Some(v.to_string());
        self
    }

    pub fn with_path(mut self, v: &str) -> Self {
        self.path = Some(v.to_string());
        self
    }

    pub fn with_interface(mut self, v: &str) -> Self {
        self.interface = Some(v.to_string());
        self
    }

    pub fn with_member(mut self, v: &str) -> Self {
        self.member = Some(v.to_string());
        self
    }

    pub fn with_error_name(mut self, v: &str) -> Self {
        self.error_name = Some(v.to_string());
        self
    }

    pub fn with_reply_serial(mut self, v: u32) -> Self {
        self.reply_serial = Some(v);
        self
    }

    pub fn with_argument(mut self, index: usize, value: &str) -> Self {
        self.arguments.push((index, value.to_string()));
        self
    }

    /// Hook run when the match is removed, whether explicitly or during
    /// connection teardown.
    pub fn with_release(mut self, f: impl FnOnce() + 'static) -> Self {
        self.release = Some(Box::new(f));
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyPair) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

/// Opaque handle returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchHandle(u64);

pub(crate) struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    destination: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    arguments: Vec<(usize, String)>,
}

impl MatchRule {
    pub(crate) fn has_argument_filters(&self) -> bool {
        !self.arguments.is_empty()
    }

    pub(crate) fn accepts_headers(&self, m: &Message) -> bool {
        fn eq(rule: &Option<String>, field: &Option<String>) -> bool {
            match rule {
                None => true,
                Some(v) => field.as_deref() == Some(v.as_str()),
            }
        }
        if let Some(t) = self.message_type {
            if m.message_type != t {
                return false;
            }
        }
        if let Some(rs) = self.reply_serial {
            if m.reply_serial != Some(rs) {
                return false;
            }
        }
        eq(&self.sender, &m.sender)
            && eq(&self.destination, &m.destination)
            && eq(&self.path, &m.path)
            && eq(&self.interface, &m.interface)
            && eq(&self.member, &m.member)
            && eq(&self.error_name, &m.error_name)
    }

    pub(crate) fn accepts_args(&self, args: &[Option<&str>]) -> bool {
        self.arguments
            .iter()
            .all(|(i, v)| args.get(*i).map(|a| *a == Some(v.as_str())) == Some(true))
    }
}

pub(crate) struct MatchEntry {
    pub(crate) rule: MatchRule,
    pub(crate) callback: MatchCallback,
    pub(crate) release: RefCell<Option<ReleaseHook>>,
    pub(crate) proxy: Option<ProxyPair>,
}

#[derive(Default)]
pub(crate) struct MatchRegistry {
    entries: BTreeMap<u64, Rc<MatchEntry>>,
    next_id: u64,
}

impl MatchRegistry {
    pub(crate) fn insert(&mut self, m: Match) -> MatchHandle {
        self.next_id += 1;
        let id = self.next_id;
        let entry = MatchEntry {
            rule: MatchRule {
                message_type: m.message_type,
                sender: m.sender,
                destination: m.destination,
                path: m.path,
                interface: m.interface,
                member: m.member,
                error_name: m.error_name,
                reply_serial: m.reply_serial,
                arguments: m.arguments,
            },
            callback: m.callback,
            release: RefCell::new(m.release),
            proxy: m.proxy,
        };
        trace!("add match {}", id);
        self.entries.insert(id, Rc::new(entry));
        MatchHandle(id)
    }

    pub(crate) fn remove(&mut self, h: MatchHandle) -> Option<Rc<MatchEntry>> {
        let removed = self.entries.remove(&h.0);
        if removed.is_some() {
            trace!("remove match {}", h.0);
        }
        removed
    }

    pub(crate) fn contains(&self, h: MatchHandle) -> bool {
        self.entries.contains_key(&h.0)
    }

    /// Insertion-order snapshot taken at dispatch start.
    pub(crate) fn snapshot(&self) -> Vec<(MatchHandle, Rc<MatchEntry>)> {
        self.entries
            .iter()
            .map(|(id, e)| (MatchHandle(*id), Rc::clone(e)))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Rc<MatchEntry>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
