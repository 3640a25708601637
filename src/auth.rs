//! Line-based SASL client for the pre-message authentication exchange.
//!
//! The exchange runs over the same transport as framed traffic: the client
//! opens with a single NUL credential byte and an `AUTH` line, the server
//! answers `OK <guid>` or `REJECTED <mechs>`, and the client finishes with
//! `BEGIN`. Framed messages may follow immediately after the `BEGIN` line.
//! The connection owns the `\r\n` framing; this type only sees whole lines.

use crate::error::*;

/// What to do next with the transport.
pub enum SaslStep {
    /// Write these bytes and keep reading lines.
    Send(Vec<u8>),
    /// Write these bytes (the `BEGIN` line); the exchange is complete and
    /// framed traffic follows.
    Begin(Vec<u8>),
}

enum Mechanism {
    #[cfg(unix)]
    External,
    Anonymous,
}

enum State {
    Start,
    WaitingForOk,
    Done,
}

pub struct SaslClient {
    mechanism: Mechanism,
    state: State,
    server_guid: Option<String>,
}

impl SaslClient {
    /// EXTERNAL authentication, identifying as the process euid.
    #[cfg(unix)]
    pub fn external() -> SaslClient {
        SaslClient {
            mechanism: Mechanism::External,
            state: State::Start,
            server_guid: None,
        }
    }

    /// ANONYMOUS authentication.
    pub fn anonymous() -> SaslClient {
        SaslClient {
            mechanism: Mechanism::Anonymous,
            state: State::Start,
            server_guid: None,
        }
    }

    /// Opening bytes: the NUL credential byte plus the AUTH line.
    pub fn initial(&mut self) -> Vec<u8> {
        let mut out = vec![0u8];
        match self.mechanism {
            #[cfg(unix)]
            Mechanism::External => {
                out.extend_from_slice(b"AUTH EXTERNAL ");
                out.extend_from_slice(hex_encode(&euid_string()).as_bytes());
            }
            Mechanism::Anonymous => out.extend_from_slice(b"AUTH ANONYMOUS"),
        }
        out.extend_from_slice(b"\r\n");
        self.state = State::WaitingForOk;
        out
    }

    /// Feeds one server line (without the trailing `\r\n`).
    pub fn advance(&mut self, line: &str) -> Result<SaslStep> {
        match self.state {
            State::WaitingForOk => {
                if let Some(guid) = line.strip_prefix("OK ") {
                    self.server_guid = Some(guid.trim().to_string());
                    self.state = State::Done;
                    Ok(SaslStep::Begin(b"BEGIN\r\n".to_vec()))
                } else if line.starts_with("REJECTED") {
                    Err(context!(ErrorKind::Auth(line.to_string())))
                } else {
                    Err(context!(ErrorKind::Auth(format!(
                        "unexpected server line '{}'",
                        line
                    ))))
                }
            }
            State::Start | State::Done => Err(context!(ErrorKind::Auth(
                "no exchange in progress".into()
            ))),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Server GUID from the OK line, once authenticated.
    pub fn server_guid(&self) -> Option<&str> {
        self.server_guid.as_deref()
    }
}

#[cfg(unix)]
fn euid_string() -> String {
    // SAFETY: geteuid has no failure modes or preconditions.
    let uid = unsafe { libc::geteuid() };
    uid.to_string()
}

/// ASCII-hex encoding of the identity string, per the SASL profile.
fn hex_encode(s: &str) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_is_hex_of_decimal_digits() {
        assert_eq!(hex_encode("1000"), "31303030");
        assert_eq!(hex_encode("0"), "30");
    }

    #[test]
    fn anonymous_handshake() {
        let mut c = SaslClient::anonymous();
        let first = c.initial();
        assert_eq!(first[0], 0);
        assert!(first.ends_with(b"AUTH ANONYMOUS\r\n"));
        assert!(!c.is_done());

        match c.advance("OK 1234deadbeef").unwrap() {
            SaslStep::Begin(b) => assert_eq!(b, b"BEGIN\r\n"),
            _ => panic!("expected BEGIN"),
        }
        assert!(c.is_done());
        assert_eq!(c.server_guid(), Some("1234deadbeef"));
    }

    #[cfg(unix)]
    #[test]
    fn external_announces_uid() {
        let mut c = SaslClient::external();
        let first = c.initial();
        let line = std::str::from_utf8(&first[1..]).unwrap();
        assert!(line.starts_with("AUTH EXTERNAL "));
        let hex = line
            .trim_end()
            .strip_prefix("AUTH EXTERNAL ")
            .unwrap();
        assert!(!hex.is_empty());
        assert!(hex.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn rejection_is_an_error() {
        let mut c = SaslClient::anonymous();
        let _ = c.initial();
        assert!(c.advance("REJECTED EXTERNAL").is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        let mut c = SaslClient::anonymous();
        let _ = c.initial();
        assert!(c.advance("DATA deadbeef").is_err());
    }
}
