//! Socket plumbing for callers that want the library to open the
//! transport.
//!
//! The connection core never performs I/O; these helpers cover the common
//! case of resolving a bus address from the environment, connecting a
//! socket, and wiring its halves to `append_input` and the send callback.

use std::env;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(windows)]
use uds_windows::UnixStream;

use crate::error::*;

/// Default system bus location when the environment does not say.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// A connected bus socket, from [`bus_connect`].
///
/// A single-threaded loop can read and write the stream directly; a
/// reader thread plus a send callback use [`BusStream::split`].
pub enum BusStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl BusStream {
    /// Independent reader and writer halves over the same socket: the
    /// reader feeds [`crate::Connection::append_input`], the writer goes
    /// into the send callback.
    pub fn split(&self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        match self {
            BusStream::Tcp(s) => Ok((
                Box::new(s.try_clone().map_err(map_context!())?),
                Box::new(s.try_clone().map_err(map_context!())?),
            )),
            BusStream::Unix(s) => Ok((
                Box::new(s.try_clone().map_err(map_context!())?),
                Box::new(s.try_clone().map_err(map_context!())?),
            )),
        }
    }

    /// Shuts down both directions; split-off readers see end of stream.
    pub fn shutdown(&self) -> Result<()> {
        match self {
            BusStream::Tcp(s) => s.shutdown(Shutdown::Both).map_err(map_context!())?,
            BusStream::Unix(s) => s.shutdown(Shutdown::Both).map_err(map_context!())?,
        }
        Ok(())
    }
}

impl Read for BusStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BusStream::Tcp(s) => s.read(buf),
            BusStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for BusStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BusStream::Tcp(s) => s.write(buf),
            BusStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BusStream::Tcp(s) => s.flush(),
            BusStream::Unix(s) => s.flush(),
        }
    }
}

/// Session bus address from `DBUS_SESSION_BUS_ADDRESS`.
pub fn session_bus_address() -> Result<String> {
    env::var("DBUS_SESSION_BUS_ADDRESS").map_err(|_| context!(ErrorKind::InvalidAddress))
}

/// System bus address from `DBUS_SYSTEM_BUS_ADDRESS`, with the usual
/// fallback location.
pub fn system_bus_address() -> String {
    env::var("DBUS_SYSTEM_BUS_ADDRESS").unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_string())
}

/// Connects to a bus server address: a `;`-separated list of
/// `transport:key=value,...` entries, tried in order. Supported transports
/// are `unix:path=`, `unix:abstract=` (Linux) and `tcp:host=...,port=...`.
pub fn bus_connect(address: &str) -> Result<(BusStream, String)> {
    let mut last_err = None;
    for entry in address.split(';').filter(|e| !e.is_empty()) {
        match connect_entry(entry) {
            Ok(stream) => return Ok((stream, entry.to_string())),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| context!(ErrorKind::InvalidAddress)))
}

fn connect_entry(entry: &str) -> Result<BusStream> {
    let (transport, params) = entry
        .split_once(':')
        .ok_or_else(|| context!(ErrorKind::InvalidAddress))?;
    let lookup = |key: &str| -> Option<&str> {
        params
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    };
    match transport {
        "unix" => {
            if let Some(path) = lookup("path") {
                let s = UnixStream::connect(path).map_err(map_context!())?;
                return Ok(BusStream::Unix(s));
            }
            #[cfg(target_os = "linux")]
            if let Some(name) = lookup("abstract") {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
                    .map_err(map_context!())?;
                let s = UnixStream::connect_addr(&addr).map_err(map_context!())?;
                return Ok(BusStream::Unix(s));
            }
            Err(context!(ErrorKind::InvalidAddress))
        }
        "tcp" => {
            let host = lookup("host").ok_or_else(|| context!(ErrorKind::InvalidAddress))?;
            let port = lookup("port").ok_or_else(|| context!(ErrorKind::InvalidAddress))?;
            let s = TcpStream::connect((host, port.parse::<u16>().map_err(|_| {
                context!(ErrorKind::InvalidAddress)
            })?))
            .map_err(map_context!())?;
            Ok(BusStream::Tcp(s))
        }
        _ => Err(context!(ErrorKind::InvalidAddress)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_addresses_rejected() {
        assert!(bus_connect("").is_err());
        assert!(bus_connect("bogus").is_err());
        assert!(bus_connect("launchd:env=FOO").is_err());
        assert!(bus_connect("tcp:host=localhost").is_err());
        assert!(bus_connect("tcp:host=localhost,port=notaport").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn unix_socket_split_round_trip() {
        use std::io::{Read as _, Write as _};
        use std::os::unix::net::UnixListener;

        let dir = std::env::temp_dir().join(format!("wirebus-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sock");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let addr = format!("unix:path={}", path.display());
        let (stream, used) = bus_connect(&addr).unwrap();
        assert_eq!(used, addr);
        let (mut server, _) = listener.accept().unwrap();

        let (mut reader, mut writer) = stream.split().unwrap();
        let mut buf = [0u8; 4];

        writer.write_all(b"ping").unwrap();
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        stream.shutdown().unwrap();
        assert_eq!(server.read(&mut buf).unwrap(), 0);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_dir(&dir);
    }
}
