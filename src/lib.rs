//! Client-side connection engine for the D-Bus inter-process message bus
//! protocol.
//!
//! The crate parses and emits wire-format messages, multiplexes method
//! calls and their replies over one full-duplex byte stream, dispatches
//! incoming calls to locally bound objects, and fans broadcast signals out
//! to subscription rules. The [`Connection`] performs no I/O: the caller
//! pushes received bytes into [`Connection::append_input`] and supplies a
//! send callback for outgoing blobs, which keeps the engine usable from
//! any event loop. [`stream`] has helpers for the common socket setups.
//!
//! # Connecting
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use wirebus::auth::SaslClient;
//! use wirebus::stream::{bus_connect, session_bus_address};
//! use wirebus::Connection;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sock, _entry) = bus_connect(&session_bus_address()?)?;
//!     let (mut reader, mut writer) = sock.split()?;
//!
//!     let mut conn = Connection::new(Box::new(move |bytes| writer.write_all(bytes)));
//!     conn.on_connected(|conn| {
//!         println!("connected as {}", conn.unique_name().unwrap_or("?"));
//!     });
//!     conn.connect(SaslClient::external())?;
//!
//!     let mut buf = [0u8; 4096];
//!     loop {
//!         let n = reader.read(&mut buf)?;
//!         if n == 0 {
//!             break;
//!         }
//!         conn.append_input(&buf[..n])?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Serving objects
//!
//! ```no_run
//! use wirebus::{Connection, Interface, Method, MessageFactory, CallError};
//!
//! fn bind_demo(conn: &mut Connection) -> wirebus::Result<()> {
//!     conn.bind(
//!         "/demo",
//!         Interface::new("org.example.Demo").method(
//!             Method::new("Ping", |conn, msg| {
//!                 let mut reply = MessageFactory::method_return(msg);
//!                 reply.args().append_string("pong").map_err(|_| {
//!                     CallError::bare("org.example.Demo.Internal")
//!                 })?;
//!                 conn.send(&mut reply)
//!                     .map_err(|_| CallError::bare("org.example.Demo.Internal"))?;
//!                 Ok(())
//!             })
//!             .out_arg("pong", "s"),
//!         ),
//!     )
//! }
//! ```
//!
//! Incoming signals are observed through [`Match`] registrations, and
//! replies to outgoing calls through [`Reply`] registrations; both accept
//! an optional [`ProxyPair`] to trampoline callbacks onto another thread's
//! event loop.

pub mod auth;
pub mod buffer;
pub mod connection;
pub mod error;
pub mod factory;
pub mod iter;
pub mod matches;
pub mod message;
mod names;
pub mod objects;
pub mod reply;
pub mod signature;
pub mod stream;


pub use crate::buffer::Buffer;
pub use crate::connection::{
    Connection, ConnectionState, ProxyPair, ReleaseHook, SendCallback, ERROR_DISCONNECTED,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::factory::MessageFactory;
pub use crate::iter::{ArrayIter, Iter, VariantIter};
pub use crate::matches::{Match, MatchHandle};
pub use crate::message::{
    message_size, parse, Message, MessageType, Parsed, FLAG_NO_AUTO_START,
    FLAG_NO_REPLY_EXPECTED, MAX_BODY_SIZE, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use crate::names::ERROR_NAME_HAS_NO_OWNER;
pub use crate::objects::{
    Access, Argument, CallError, Direction, Interface, Method, MethodResult, Property, Signal,
    ERROR_INVALID_METHOD, ERROR_INVALID_PATH, INTROSPECTABLE_INTERFACE,
};
pub use crate::reply::{Reply, ReplyHandle};
pub use crate::signature::TypeKind;

/// The bus daemon's well-known name.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// The bus daemon's object path.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
/// The bus daemon's interface.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
