use chainerror::*;
use std::io;

macro_rules! context {
    ($k:expr) => {
        chainerror::ChainError::<_>::new(
            $k,
            None,
            Some(::std::panic::Location::caller().to_string()),
        )
    };
}

macro_rules! map_context {
    () => {
        |e| {
            chainerror::IntoChainError::into_chain_error(
                e,
                Some(::std::panic::Location::caller().to_string()),
            )
        }
    };
}

pub(crate) use context;
pub(crate) use map_context;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    Parse(String),
    InvalidSignature(String),
    MessageTooLarge(usize),
    InvalidMessage(String),
    ReplyCollision(String, u32),
    Auth(String),
    InvalidAddress,
    NotConnected,
    AlreadyConnected,
    ConnectionClosed,
    Generic,
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::Parse(v) => write!(f, "Wire format error: {}", v),
            ErrorKind::InvalidSignature(v) => write!(f, "Invalid type signature: '{}'", v),
            ErrorKind::MessageTooLarge(v) => write!(f, "Message of {} bytes exceeds limit", v),
            ErrorKind::InvalidMessage(v) => write!(f, "Invalid message: {}", v),
            ErrorKind::ReplyCollision(r, s) => {
                write!(f, "Reply already registered for {} serial {}", r, s)
            }
            ErrorKind::Auth(v) => write!(f, "Authentication failed: {}", v),
            ErrorKind::InvalidAddress => write!(f, "Invalid bus address"),
            ErrorKind::NotConnected => write!(f, "Connection not established"),
            ErrorKind::AlreadyConnected => write!(f, "Connection already established"),
            ErrorKind::ConnectionClosed => write!(f, "Connection closed"),
            ErrorKind::Generic => Ok(()),
        }
    }
}

impl ChainErrorFrom<std::io::Error> for ErrorKind {
    fn chain_error_from(
        e: io::Error,
        line_filename: Option<String>,
    ) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => {
                ChainError::<_>::new(ErrorKind::ConnectionClosed, Some(Box::from(e)), line_filename)
            }

            kind => ChainError::<_>::new(ErrorKind::Io(kind), Some(Box::from(e)), line_filename),
        }
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;
