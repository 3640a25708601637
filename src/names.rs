//! Well-known-name tracking and reply-key rewriting.
//!
//! Replies are matched by sender unique name, so a registration addressed
//! to a well-known name must be re-keyed to the owning unique name. The
//! rewrite happens at registration time: a known owner re-keys
//! immediately, otherwise the registration is parked while `GetNameOwner`
//! is asked, and `NameOwnerChanged` keeps the owner table current from
//! then on.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::*;
use crate::factory::MessageFactory;
use crate::matches::{Match, MatchHandle};
use crate::message::{Message, MessageType};
use crate::reply::{Reply, ReplyEntry, ReplyHandle};

/// Synthetic error delivered when the destination has no owner.
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

enum OwnerState {
    Querying,
    Owner(String),
    NoOwner,
}

struct TrackedName {
    state: OwnerState,
    parked: Vec<(u32, ReplyEntry)>,
}

#[derive(Default)]
pub(crate) struct NameTracker {
    names: HashMap<String, TrackedName>,
    owner_match: Option<MatchHandle>,
}

pub(crate) fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

pub(crate) fn register_reply(conn: &mut Connection, reply: Reply) -> Result<ReplyHandle> {
    let (remote, serial, entry) = reply.into_parts();
    if remote.is_empty() {
        return Err(context!(ErrorKind::InvalidMessage(
            "reply registration without a remote".into()
        )));
    }
    if is_unique_name(&remote) || remote == crate::BUS_NAME {
        conn.replies.insert(&remote, serial, entry)?;
        return Ok(ReplyHandle { remote, serial });
    }

    ensure_owner_match(conn);

    enum Known {
        Owner(String),
        Querying,
        NoOwner,
        Untracked,
    }
    let known = match conn.names.names.get(&remote) {
        Some(t) => match &t.state {
            OwnerState::Owner(u) => Known::Owner(u.clone()),
            OwnerState::Querying => Known::Querying,
            OwnerState::NoOwner => Known::NoOwner,
        },
        None => Known::Untracked,
    };
    match known {
        Known::Owner(unique) => {
            conn.replies.insert(&unique, serial, entry)?;
            Ok(ReplyHandle {
                remote: unique,
                serial,
            })
        }
        Known::Querying => {
            if let Some(t) = conn.names.names.get_mut(&remote) {
                t.parked.push((serial, entry));
            }
            Ok(ReplyHandle { remote, serial })
        }
        Known::NoOwner => {
            deliver_no_owner(conn, &remote, vec![(serial, entry)]);
            Ok(ReplyHandle { remote, serial })
        }
        Known::Untracked => {
            conn.names.names.insert(
                remote.clone(),
                TrackedName {
                    state: OwnerState::Querying,
                    parked: vec![(serial, entry)],
                },
            );
            start_owner_query(conn, &remote)?;
            Ok(ReplyHandle { remote, serial })
        }
    }
}

/// Removes a still-parked registration (explicit removal before the owner
/// query finished).
pub(crate) fn take_parked(conn: &mut Connection, handle: &ReplyHandle) -> Option<ReplyEntry> {
    let t = conn.names.names.get_mut(&handle.remote)?;
    let idx = t.parked.iter().position(|(s, _)| *s == handle.serial)?;
    Some(t.parked.remove(idx).1)
}

/// Current owner of a tracked well-known name, if known.
pub(crate) fn owner_of(conn: &Connection, name: &str) -> Option<String> {
    match conn.names.names.get(name)?.state {
        OwnerState::Owner(ref u) => Some(u.clone()),
        _ => None,
    }
}

/// Empties every parking lot, for connection teardown.
pub(crate) fn drain_parked(conn: &mut Connection) -> Vec<(u32, ReplyEntry)> {
    conn.names
        .names
        .values_mut()
        .flat_map(|t| t.parked.drain(..))
        .collect()
}

/// Subscribes to NameOwnerChanged, once.
fn ensure_owner_match(conn: &mut Connection) {
    if conn.names.owner_match.is_some() {
        return;
    }
    let m = Match::new(|conn: &mut Connection, msg: &Message| {
        let mut it = msg.args();
        let (name, new_owner) = match (it.read_string(), it.read_string(), it.read_string()) {
            (Ok(name), Ok(_old), Ok(new)) => (name.to_string(), new.to_string()),
            _ => return,
        };
        if let Some(t) = conn.names.names.get_mut(&name) {
            if new_owner.is_empty() {
                debug!("{} lost its owner", name);
                t.state = OwnerState::NoOwner;
            } else {
                debug!("{} now owned by {}", name, new_owner);
                t.state = OwnerState::Owner(new_owner);
            }
        }
    })
    .with_message_type(MessageType::Signal)
    .with_sender(crate::BUS_NAME)
    .with_path(crate::BUS_PATH)
    .with_interface(crate::BUS_INTERFACE)
    .with_member("NameOwnerChanged");
    conn.names.owner_match = Some(conn.add_match(m));
}

/// Asks the bus who owns `name` and subscribes to ownership changes for
/// it. The query's reply moves the parked registrations to the unique
/// name, or delivers them synthetic errors when nobody owns it.
fn start_owner_query(conn: &mut Connection, name: &str) -> Result<()> {
    trace!("querying owner of {}", name);

    let mut sub = MessageFactory::method_call(crate::BUS_PATH, "AddMatch");
    sub.set_destination(crate::BUS_NAME)
        .set_interface(crate::BUS_INTERFACE)
        .set_no_reply_expected(true);
    sub.args().append_string(&format!(
        "type='signal',sender='{}',interface='{}',member='NameOwnerChanged',arg0='{}'",
        crate::BUS_NAME,
        crate::BUS_INTERFACE,
        name
    ))?;
    conn.send(&mut sub)?;

    let serial = conn.next_serial();
    let on_ok = name.to_string();
    let on_err = name.to_string();
    let reply = Reply::new(crate::BUS_NAME, serial)
        .on_reply(move |conn, msg| match msg.args().read_string() {
            Ok(owner) => owner_resolved(conn, &on_ok, Some(owner.to_string())),
            Err(_) => owner_resolved(conn, &on_ok, None),
        })
        .on_error(move |conn, _msg| owner_resolved(conn, &on_err, None));
    conn.add_reply(reply)?;

    let mut f = MessageFactory::method_call(crate::BUS_PATH, "GetNameOwner");
    f.set_destination(crate::BUS_NAME)
        .set_interface(crate::BUS_INTERFACE)
        .set_serial(serial);
    f.args().append_string(name)?;
    conn.send(&mut f)?;
    Ok(())
}

fn owner_resolved(conn: &mut Connection, name: &str, owner: Option<String>) {
    let parked = match conn.names.names.get_mut(name) {
        Some(t) => {
            t.state = match owner {
                Some(ref u) => OwnerState::Owner(u.clone()),
                None => OwnerState::NoOwner,
            };
            std::mem::take(&mut t.parked)
        }
        None => return,
    };
    match owner {
        Some(unique) => {
            debug!("{} owned by {}", name, unique);
            for (serial, entry) in parked {
                if let Err(e) = conn.replies.insert(&unique, serial, entry) {
                    warn!("dropping parked reply: {}", e);
                }
            }
        }
        None => {
            debug!("{} has no owner", name);
            deliver_no_owner(conn, name, parked);
        }
    }
}

fn deliver_no_owner(conn: &mut Connection, name: &str, parked: Vec<(u32, ReplyEntry)>) {
    for (serial, entry) in parked {
        let text = format!("Name {} does not have an owner", name);
        match conn.synthetic_error(serial, ERROR_NAME_HAS_NO_OWNER, &text) {
            Ok(msg) => entry.deliver(conn, &msg),
            Err(_) => entry.discard(),
        }
    }
}
