//! The connection core: handshake state machine, receive-buffer pump and
//! message routing.
//!
//! The connection performs no I/O of its own. Inbound bytes are pushed in
//! through [`Connection::append_input`]; outbound blobs are pushed out
//! through the send callback supplied at construction. All entry points
//! must be invoked on the connection thread; callbacks wanting delivery on
//! another thread attach a [`ProxyPair`].

use std::rc::Rc;

use log::{debug, trace, warn};

use crate::auth::{SaslClient, SaslStep};
use crate::error::*;
use crate::factory::MessageFactory;
use crate::matches::{Match, MatchHandle, MatchRegistry};
use crate::message::{self, Message, MessageType, Parsed, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};
use crate::names::{self, NameTracker};
use crate::objects::{
    DispatchMiss, Interface, ObjectRegistry, Resolved, ERROR_INVALID_METHOD, ERROR_INVALID_PATH,
};
use crate::reply::{Reply, ReplyHandle, ReplyRegistry};

/// Synthetic error delivered to every pending reply when the connection
/// closes.
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";

/// Transport vtable: called with each finished wire blob. Failures
/// propagate to the caller of the operation that triggered the write.
pub type SendCallback = Box<dyn FnMut(&[u8]) -> std::io::Result<()>>;

/// Hook run when a match or reply registration is released.
pub type ReleaseHook = Box<dyn FnOnce()>;

/// A pair of trampolines ferrying callback invocations to another thread's
/// event loop. The forward proxy receives a closure it is contractually
/// obliged to run synchronously on the target thread; the release proxy
/// ferries release hooks the same way. The core knows nothing else about
/// threads.
#[derive(Clone)]
pub struct ProxyPair {
    pub forward: Rc<dyn Fn(&mut dyn FnMut())>,
    pub release: Rc<dyn Fn(&mut dyn FnMut())>,
}

pub(crate) fn run_proxied(proxy: Option<&ProxyPair>, f: impl FnOnce()) {
    match proxy {
        Some(p) => {
            let mut f = Some(f);
            (p.forward)(&mut || {
                if let Some(f) = f.take() {
                    f()
                }
            });
        }
        None => f(),
    }
}

pub(crate) fn run_release(proxy: Option<&ProxyPair>, hook: ReleaseHook) {
    match proxy {
        Some(p) => {
            let mut hook = Some(hook);
            (p.release)(&mut || {
                if let Some(h) = hook.take() {
                    h()
                }
            });
        }
        None => hook(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Authenticating,
    HelloPending,
    Ready,
    Closed,
}

pub struct Connection {
    state: ConnectionState,
    serial: u32,
    unique_name: Option<String>,
    send_cb: SendCallback,
    on_connected: Option<Box<dyn FnOnce(&mut Connection)>>,
    sasl: Option<SaslClient>,
    recv: Vec<u8>,
    pub(crate) matches: MatchRegistry,
    pub(crate) replies: ReplyRegistry,
    pub(crate) objects: ObjectRegistry,
    pub(crate) names: NameTracker,
}

impl Connection {
    pub fn new(send: SendCallback) -> Connection {
        Connection {
            state: ConnectionState::Unconnected,
            serial: 1,
            unique_name: None,
            send_cb: send,
            on_connected: None,
            sasl: None,
            recv: Vec::new(),
            matches: MatchRegistry::default(),
            replies: ReplyRegistry::default(),
            objects: ObjectRegistry::default(),
            names: NameTracker::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// The bus-assigned unique name, available once Ready.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// Notification fired once, when the Hello round trip completes.
    pub fn on_connected(&mut self, f: impl FnOnce(&mut Connection) + 'static) {
        self.on_connected = Some(Box::new(f));
    }

    /// Starts the authentication exchange on the transport.
    pub fn connect(&mut self, mut sasl: SaslClient) -> Result<()> {
        if self.state != ConnectionState::Unconnected {
            return Err(context!(ErrorKind::AlreadyConnected));
        }
        let initial = sasl.initial();
        self.send_bytes(&initial)?;
        self.sasl = Some(sasl);
        self.state = ConnectionState::Authenticating;
        debug!("authenticating");
        Ok(())
    }

    /// Feeds transport bytes into the connection. During authentication the
    /// bytes are consumed line-wise by the SASL client; afterwards whole
    /// messages are peeled off and routed until insufficient bytes remain.
    /// A parse error closes the connection.
    pub fn append_input(&mut self, bytes: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Unconnected => Err(context!(ErrorKind::NotConnected)),
            ConnectionState::Closed => Err(context!(ErrorKind::ConnectionClosed)),
            ConnectionState::Authenticating => {
                self.recv.extend_from_slice(bytes);
                self.drive_auth()?;
                if self.state != ConnectionState::Authenticating {
                    self.pump()?;
                }
                Ok(())
            }
            ConnectionState::HelloPending | ConnectionState::Ready => {
                self.recv.extend_from_slice(bytes);
                self.pump()
            }
        }
    }

    /// Fresh outgoing serial; the counter starts at 1 and skips 0 on wrap.
    pub fn next_serial(&mut self) -> u32 {
        let s = self.serial;
        self.serial = self.serial.checked_add(1).unwrap_or(1);
        s
    }

    /// Finalizes the draft and writes it out, assigning a serial unless the
    /// caller reserved one. Returns the serial used.
    pub fn send(&mut self, factory: &mut MessageFactory) -> Result<u32> {
        match self.state {
            ConnectionState::HelloPending | ConnectionState::Ready => {}
            ConnectionState::Closed => return Err(context!(ErrorKind::ConnectionClosed)),
            _ => return Err(context!(ErrorKind::NotConnected)),
        }
        let serial = match factory.serial() {
            Some(s) => s,
            None => self.next_serial(),
        };
        let data = factory.build(serial)?;
        self.send_bytes(&data)?;
        Ok(serial)
    }

    pub fn add_match(&mut self, m: Match) -> MatchHandle {
        self.matches.insert(m)
    }

    /// Removes a match and runs its release hook. Removing an already
    /// removed match is a no-op.
    pub fn remove_match(&mut self, h: MatchHandle) {
        if let Some(entry) = self.matches.remove(h) {
            if let Some(hook) = entry.release.borrow_mut().take() {
                run_release(entry.proxy.as_ref(), hook);
            }
        }
    }

    /// Registers for the reply to an outgoing call. A well-known
    /// destination is resolved to its owning unique name, querying the bus
    /// daemon when the owner is not yet known.
    pub fn add_reply(&mut self, reply: Reply) -> Result<ReplyHandle> {
        names::register_reply(self, reply)
    }

    /// Removes a pending reply and runs its release hooks. A no-op once
    /// the reply has been delivered or removed. Handles carrying a
    /// well-known name also cover the entry after it was re-keyed to the
    /// owner's unique name.
    pub fn remove_reply(&mut self, handle: &ReplyHandle) {
        if let Some(entry) = self.replies.take(&handle.remote, handle.serial) {
            entry.discard();
        } else if let Some(entry) = names::take_parked(self, handle) {
            entry.discard();
        } else if let Some(owner) = names::owner_of(self, &handle.remote) {
            if let Some(entry) = self.replies.take(&owner, handle.serial) {
                entry.discard();
            }
        }
    }

    /// Ensures a node exists at `path` (providing Introspect there).
    pub fn add_object(&mut self, path: &str) -> Result<()> {
        self.objects.add_object(path)
    }

    /// Binds `interface` at `path` so method calls resolve to its handlers.
    pub fn bind(&mut self, path: &str, interface: Interface) -> Result<()> {
        self.objects.bind(path, interface)
    }

    pub fn unbind(&mut self, path: &str, interface: &str) {
        self.objects.unbind(path, interface);
    }

    pub fn unbind_all(&mut self, path: &str) {
        self.objects.unbind_all(path);
    }

    /// Introspection XML for a bound path.
    pub fn introspect(&self, path: &str) -> Option<String> {
        self.objects.introspect(path)
    }

    /// Closes the connection: every pending reply is completed with a
    /// synthetic Disconnected error, every match is released. Terminal.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!("closing connection");
        self.state = ConnectionState::Closed;
        self.sasl = None;
        self.on_connected = None;
        self.recv.clear();

        let parked = names::drain_parked(self);
        let pending = self.replies.drain();
        for (_, serial, entry) in pending {
            match self.synthetic_error(serial, ERROR_DISCONNECTED, "Connection closed") {
                Ok(msg) => entry.deliver(self, &msg),
                Err(_) => entry.discard(),
            }
        }
        for (serial, entry) in parked {
            match self.synthetic_error(serial, ERROR_DISCONNECTED, "Connection closed") {
                Ok(msg) => entry.deliver(self, &msg),
                Err(_) => entry.discard(),
            }
        }
        for entry in self.matches.drain() {
            if let Some(hook) = entry.release.borrow_mut().take() {
                run_release(entry.proxy.as_ref(), hook);
            }
        }
        self.objects = ObjectRegistry::default();
        self.names = NameTracker::default();
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        (self.send_cb)(bytes).map_err(map_context!())?;
        Ok(())
    }

    /// Fabricates a locally parsed Error message, used for synthetic
    /// deliveries (no owner, disconnect).
    pub(crate) fn synthetic_error(
        &mut self,
        reply_serial: u32,
        name: &str,
        text: &str,
    ) -> Result<Message> {
        let mut f = MessageFactory::new(MessageType::Error);
        f.set_error_name(name).set_reply_serial(reply_serial);
        f.args().append_string(text)?;
        let serial = self.next_serial();
        match message::parse(f.build(serial)?)? {
            Parsed::Message(m) => Ok(m),
            Parsed::Ignored => Err(context!(ErrorKind::Generic)),
        }
    }

    fn drive_auth(&mut self) -> Result<()> {
        let mut sasl = match self.sasl.take() {
            Some(s) => s,
            None => return Err(context!(ErrorKind::NotConnected)),
        };
        while self.state == ConnectionState::Authenticating {
            let pos = match self.recv.windows(2).position(|w| w == b"\r\n") {
                Some(p) => p,
                None => break,
            };
            let raw: Vec<u8> = self.recv.drain(..pos + 2).collect();
            let line = match std::str::from_utf8(&raw[..raw.len() - 2]) {
                Ok(l) => l,
                Err(_) => {
                    self.close();
                    return Err(context!(ErrorKind::Auth("non-UTF-8 server line".into())));
                }
            };
            match sasl.advance(line) {
                Ok(SaslStep::Send(data)) => self.send_bytes(&data)?,
                Ok(SaslStep::Begin(data)) => {
                    self.send_bytes(&data)?;
                    self.state = ConnectionState::HelloPending;
                    debug!("authentication complete");
                    self.send_hello()?;
                }
                Err(e) => {
                    warn!("authentication failed: {}", e);
                    self.close();
                    return Err(e);
                }
            }
        }
        if self.state == ConnectionState::Authenticating {
            self.sasl = Some(sasl);
        }
        Ok(())
    }

    fn send_hello(&mut self) -> Result<()> {
        let serial = self.next_serial();
        let reply = Reply::new(crate::BUS_NAME, serial)
            .on_reply(|conn, msg| match msg.args().read_string() {
                Ok(name) => {
                    conn.unique_name = Some(name.to_string());
                    conn.state = ConnectionState::Ready;
                    debug!("connected as {}", name);
                    if let Some(f) = conn.on_connected.take() {
                        f(conn);
                    }
                }
                Err(e) => {
                    warn!("malformed Hello reply: {}", e);
                    conn.close();
                }
            })
            .on_error(|conn, msg| {
                warn!("Hello refused: {:?}", msg.error_name);
                conn.close();
            });
        self.add_reply(reply)?;

        let mut f = MessageFactory::method_call(crate::BUS_PATH, "Hello");
        f.set_destination(crate::BUS_NAME)
            .set_interface(crate::BUS_INTERFACE)
            .set_serial(serial);
        self.send(&mut f)?;
        Ok(())
    }

    fn pump(&mut self) -> Result<()> {
        loop {
            if self.state == ConnectionState::Closed {
                break;
            }
            let n = match message::message_size(&self.recv) {
                Some(n) => n,
                None => break,
            };
            if n < MIN_MESSAGE_SIZE || n > MAX_MESSAGE_SIZE {
                return self.fail(context!(ErrorKind::Parse(format!(
                    "implausible message size {}",
                    n
                ))));
            }
            if self.recv.len() < n {
                break;
            }
            let data: Vec<u8> = self.recv.drain(..n).collect();
            match message::parse(data) {
                Ok(Parsed::Message(msg)) => self.route(&msg)?,
                Ok(Parsed::Ignored) => {}
                Err(e) => return self.fail(e),
            }
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Result<()> {
        warn!("closing connection: {}", e);
        self.close();
        Err(e)
    }

    /// One message through the pipeline: method calls go to the object
    /// tree, returns and errors to the reply tables, and every message is
    /// offered to the match registry.
    fn route(&mut self, msg: &Message) -> Result<()> {
        trace!("dispatch {:?} serial {}", msg.message_type, msg.serial);
        match msg.message_type {
            MessageType::MethodCall => self.dispatch_method_call(msg)?,
            MessageType::MethodReturn | MessageType::Error => self.dispatch_reply(msg),
            _ => {}
        }
        self.dispatch_matches(msg);
        Ok(())
    }

    fn dispatch_method_call(&mut self, msg: &Message) -> Result<()> {
        let (path, member) = match (msg.path.as_deref(), msg.member.as_deref()) {
            (Some(p), Some(m)) => (p, m),
            _ => return Ok(()),
        };
        match self.objects.resolve(path, msg.interface.as_deref(), member) {
            Ok(Resolved::Handler(handler)) => {
                let result = match handler.try_borrow_mut() {
                    Ok(mut h) => (*h)(self, msg),
                    Err(_) => {
                        warn!("re-entrant method handler for {} skipped", member);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    self.send_error_reply(msg, &e.name, e.message.as_deref())?;
                }
            }
            Ok(Resolved::Introspect) => match self.objects.introspect(path) {
                Some(xml) => {
                    if msg.wants_reply() {
                        let mut f = MessageFactory::method_return(msg);
                        f.args().append_string(&xml)?;
                        self.send(&mut f)?;
                    }
                }
                None => self.send_error_reply(msg, ERROR_INVALID_PATH, Some("Path not found"))?,
            },
            Err(DispatchMiss::Path) => {
                self.send_error_reply(msg, ERROR_INVALID_PATH, Some("Path not found"))?;
            }
            Err(DispatchMiss::Method) => {
                self.send_error_reply(msg, ERROR_INVALID_METHOD, Some("No method found"))?;
            }
        }
        Ok(())
    }

    fn send_error_reply(&mut self, call: &Message, name: &str, text: Option<&str>) -> Result<()> {
        if !call.wants_reply() {
            return Ok(());
        }
        let mut f = MessageFactory::error(call, name, text)?;
        self.send(&mut f)?;
        Ok(())
    }

    /// The entry leaves the table before the callback runs, so the
    /// callback may re-register the same serial and an explicit removal
    /// during the callback finds nothing left to remove.
    fn dispatch_reply(&mut self, msg: &Message) {
        let (sender, serial) = match (msg.sender.as_deref(), msg.reply_serial) {
            (Some(s), Some(r)) => (s, r),
            _ => return,
        };
        match self.replies.take(sender, serial) {
            Some(entry) => entry.deliver(self, msg),
            None => trace!("no reply registered for {} serial {}", sender, serial),
        }
    }

    /// Offers `msg` to an insertion-order snapshot of the match registry.
    /// Entries removed by an earlier callback in the same pass are skipped.
    fn dispatch_matches(&mut self, msg: &Message) {
        let snapshot = self.matches.snapshot();
        if snapshot.is_empty() {
            return;
        }
        let mut cached_args: Option<Option<Vec<Option<&str>>>> = None;
        for (handle, entry) in snapshot {
            if self.state == ConnectionState::Closed {
                break;
            }
            if !self.matches.contains(handle) {
                continue;
            }
            if !entry.rule.accepts_headers(msg) {
                continue;
            }
            if entry.rule.has_argument_filters() {
                if cached_args.is_none() {
                    cached_args = Some(msg.string_args().ok());
                }
                match cached_args.as_ref().and_then(|a| a.as_ref()) {
                    Some(args) => {
                        if !entry.rule.accepts_args(args) {
                            continue;
                        }
                    }
                    None => continue,
                }
            }
            trace!("match {:?} fires", handle);
            run_proxied(entry.proxy.as_ref(), || {
                match entry.callback.try_borrow_mut() {
                    Ok(mut cb) => (*cb)(self, msg),
                    Err(_) => warn!("re-entrant match callback skipped"),
                }
            });
        }
    }
}
