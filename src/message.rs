//! The parsed message model and the wire-format codec.
//!
//! Framing follows the D-Bus binary protocol, version 1: a 12-byte fixed
//! header (`endianness:u8, type:u8, flags:u8, protocol:u8, body_length:u32,
//! serial:u32`), a header field array of signature `a(yv)`, padding to an
//! 8-byte boundary, then the argument body. Messages are normalized to
//! native endianness during parsing; [`Message::as_bytes`] is the exact
//! (normalized) wire image.

use log::trace;

use crate::error::*;
use crate::iter::Iter;
use crate::signature::{SigCursor, TypeKind};

/// Protocol version spoken and accepted.
pub const PROTOCOL_VERSION: u8 = 1;

/// Byte 0 of every message: 'l' for little endian, 'B' for big endian.
pub const LITTLE_ENDIAN: u8 = b'l';
pub const BIG_ENDIAN: u8 = b'B';

/// The fixed header, excluding the length prefix of the field array.
pub(crate) const FIXED_HEADER_SIZE: usize = 12;
/// Smallest prefix from which the total message size can be computed.
pub(crate) const MIN_MESSAGE_SIZE: usize = 16;

/// Largest accepted argument body (64 MiB).
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;
/// Largest accepted message (128 MiB).
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Message flag: the caller does not want a method return.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x01;
/// Message flag: do not auto-start the destination service.
pub const FLAG_NO_AUTO_START: u8 = 0x02;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;

/// Signature of the fixed header plus the header field array.
pub(crate) const HEADER_SIGNATURE: &str = "yyyyuua(yv)";

pub(crate) fn native_endianness() -> u8 {
    if cfg!(target_endian = "little") {
        LITTLE_ENDIAN
    } else {
        BIG_ENDIAN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid,
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        match v {
            0 => Some(MessageType::Invalid),
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Invalid => 0,
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }
}

/// Shape check for object paths: absolute, `/`-separated, non-empty
/// `[A-Za-z0-9_]` segments, no trailing slash.
pub fn valid_object_path(s: &str) -> bool {
    if s == "/" {
        return true;
    }
    if !s.starts_with('/') || s.ends_with('/') {
        return false;
    }
    s[1..]
        .split('/')
        .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}

/// A parsed (or locally fabricated) message, immutable once dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    data: Vec<u8>,
    body_offset: usize,
    pub message_type: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub reply_serial: Option<u32>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
}

impl Message {
    /// The exact wire image, in native endianness.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The argument blob.
    pub fn body(&self) -> &[u8] {
        &self.data[self.body_offset..]
    }

    /// Iterator over the arguments, driven by the message signature.
    pub fn args(&self) -> Iter<'_> {
        Iter::new(self.body(), 0, self.signature.as_deref().unwrap_or(""))
    }

    /// One slot per top-level argument: `Some` for strings, `None` for
    /// everything else. This is the view match rules predicate over.
    pub fn string_args(&self) -> Result<Vec<Option<&str>>> {
        let mut out = Vec::new();
        let mut it = self.args();
        while !it.at_end() {
            if it.peek() == Some(TypeKind::String) {
                out.push(Some(it.read_string()?));
            } else {
                it.skip_value()?;
                out.push(None);
            }
        }
        Ok(out)
    }

    pub fn wants_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && self.flags & FLAG_NO_REPLY_EXPECTED == 0
    }
}

/// Outcome of [`parse`]: either a routable message, or a well-formed frame
/// of a future message type, which is silently discarded.
#[derive(Debug)]
pub enum Parsed {
    Message(Message),
    Ignored,
}

fn align_to(v: usize, n: usize) -> usize {
    (v + n - 1) & !(n - 1)
}

/// Total size of the message starting at `buf[0]`, or `None` when fewer
/// than 16 bytes are available. The input needs no alignment.
pub fn message_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < MIN_MESSAGE_SIZE {
        return None;
    }
    let read = |b: &[u8]| -> usize {
        let raw = [b[0], b[1], b[2], b[3]];
        if buf[0] == LITTLE_ENDIAN {
            u32::from_le_bytes(raw) as usize
        } else {
            u32::from_be_bytes(raw) as usize
        }
    };
    let body_len = read(&buf[4..8]);
    let field_len = read(&buf[12..16]);
    Some(align_to(MIN_MESSAGE_SIZE + field_len, 8) + body_len)
}

fn parse_err(what: impl Into<String>) -> Error {
    context!(ErrorKind::Parse(what.into()))
}

/// Parses one whole message. `data` must be exactly the size reported by
/// [`message_size`]; non-native input is endian-flipped in place.
pub fn parse(mut data: Vec<u8>) -> Result<Parsed> {
    if data.len() < MIN_MESSAGE_SIZE {
        return Err(parse_err("message shorter than fixed header"));
    }
    let endianness = data[0];
    if endianness != LITTLE_ENDIAN && endianness != BIG_ENDIAN {
        return Err(parse_err(format!("unknown endianness byte {:#x}", endianness)));
    }
    let message_type = match data[1] {
        0 => return Err(parse_err("message type is Invalid")),
        t if t > MessageType::Signal.as_u8() => {
            trace!("discarding message of future type {}", t);
            return Ok(Parsed::Ignored);
        }
        t => MessageType::from_u8(t).ok_or_else(|| parse_err("unreachable message type"))?,
    };
    let native = endianness == native_endianness();
    if !native {
        flip_data(&mut data, HEADER_SIGNATURE)?;
        data[0] = native_endianness();
    }

    let flags = data[2];
    let body_len = u32::from_ne_bytes(data[4..8].try_into().unwrap()) as usize;
    let serial = u32::from_ne_bytes(data[8..12].try_into().unwrap());
    let field_len = u32::from_ne_bytes(data[12..16].try_into().unwrap()) as usize;
    let body_offset = align_to(MIN_MESSAGE_SIZE + field_len, 8);
    if body_offset + body_len != data.len() {
        return Err(parse_err("message size does not match header"));
    }
    if body_len > MAX_BODY_SIZE {
        return Err(parse_err(format!("body of {} bytes exceeds limit", body_len)));
    }

    let mut path = None;
    let mut interface = None;
    let mut member = None;
    let mut error_name = None;
    let mut reply_serial = None;
    let mut destination = None;
    let mut sender = None;
    let mut signature = None;

    {
        let mut it = Iter::new(&data, FIXED_HEADER_SIZE, "a(yv)");
        let a = it.begin_array()?;
        while it.more_in_array(&a) {
            it.begin_struct()?;
            let code = it.read_byte()?;
            let v = it.begin_variant()?;
            match code {
                0 => return Err(parse_err("header field code 0")),
                FIELD_PATH => path = Some(it.read_object_path()?.to_string()),
                FIELD_INTERFACE => interface = Some(it.read_string()?.to_string()),
                FIELD_MEMBER => member = Some(it.read_string()?.to_string()),
                FIELD_ERROR_NAME => error_name = Some(it.read_string()?.to_string()),
                FIELD_REPLY_SERIAL => reply_serial = Some(it.read_u32()?),
                FIELD_DESTINATION => destination = Some(it.read_string()?.to_string()),
                FIELD_SENDER => sender = Some(it.read_string()?.to_string()),
                FIELD_SIGNATURE => signature = Some(it.read_signature()?.to_string()),
                _ => {
                    // Forward compatible: consume and discard the value.
                    while !it.at_end() {
                        it.skip_value()?;
                    }
                }
            }
            it.end_variant(v)?;
            it.end_struct()?;
        }
        it.end_array(a)?;
    }

    match message_type {
        MessageType::MethodCall if path.is_none() || member.is_none() => {
            return Err(parse_err("method call without path or member"));
        }
        MessageType::MethodReturn if reply_serial.is_none() => {
            return Err(parse_err("method return without reply serial"));
        }
        MessageType::Error if error_name.is_none() || reply_serial.is_none() => {
            return Err(parse_err("error without error name or reply serial"));
        }
        MessageType::Signal if path.is_none() || interface.is_none() || member.is_none() => {
            return Err(parse_err("signal without path, interface or member"));
        }
        _ => {}
    }
    if body_len > 0 && signature.is_none() {
        return Err(parse_err("non-empty body without signature"));
    }

    if !native {
        if let Some(ref sig) = signature {
            flip_data(&mut data[body_offset..], sig)?;
        }
    }

    Ok(Parsed::Message(Message {
        data,
        body_offset,
        message_type,
        flags,
        serial,
        reply_serial,
        path,
        interface,
        member,
        error_name,
        destination,
        sender,
        signature,
    }))
}

/// Byte-swaps every multi-byte value described by `sig` in place. The data
/// is assumed to be in the opposite of native endianness; length prefixes
/// are readable natively once swapped.
pub(crate) fn flip_data(data: &mut [u8], sig: &str) -> Result<()> {
    let mut cur = SigCursor::new(sig);
    let mut pos = 0;
    while !cur.at_end() {
        pos = flip_one(data, pos, &mut cur)?;
    }
    Ok(())
}

fn flip_slice<'d>(data: &'d mut [u8], pos: usize, n: usize) -> Result<&'d mut [u8]> {
    let end = pos.checked_add(n).ok_or_else(|| parse_err("length overflow"))?;
    if end > data.len() {
        return Err(parse_err("unexpected end of data while flipping"));
    }
    let s = &mut data[pos..end];
    s.reverse();
    Ok(s)
}

fn flip_one(data: &mut [u8], pos: usize, cur: &mut SigCursor) -> Result<usize> {
    let kind = cur
        .peek()
        .ok_or_else(|| context!(ErrorKind::InvalidSignature(cur.rest().into())))?;
    match kind {
        TypeKind::Array => {
            cur.bump();
            let elem = cur.complete_type(true)?;
            cur.set_position(cur.position() + elem.len());
            let p = align_to(pos, 4);
            flip_slice(data, p, 4)?;
            let len = u32::from_ne_bytes(data[p..p + 4].try_into().unwrap()) as usize;
            let elem_kind = SigCursor::new(elem)
                .peek()
                .ok_or_else(|| context!(ErrorKind::InvalidSignature(elem.into())))?;
            let mut p = align_to(p + 4, elem_kind.alignment());
            let end = p.checked_add(len).ok_or_else(|| parse_err("length overflow"))?;
            if end > data.len() {
                return Err(parse_err("array extends past end of data"));
            }
            while p < end {
                let mut ecur = SigCursor::new(elem);
                while !ecur.at_end() {
                    p = flip_one(data, p, &mut ecur)?;
                }
            }
            if p != end {
                return Err(parse_err("array length does not match element data"));
            }
            Ok(end)
        }
        TypeKind::Struct => {
            cur.bump();
            let mut p = align_to(pos, 8);
            while cur.peek_code() != Some(b')') {
                p = flip_one(data, p, cur)?;
            }
            cur.bump();
            Ok(p)
        }
        TypeKind::DictEntry => {
            cur.bump();
            let mut p = align_to(pos, 8);
            p = flip_one(data, p, cur)?;
            p = flip_one(data, p, cur)?;
            if cur.peek_code() != Some(b'}') {
                return Err(context!(ErrorKind::InvalidSignature(cur.rest().into())));
            }
            cur.bump();
            Ok(p)
        }
        TypeKind::Variant => {
            cur.bump();
            if pos >= data.len() {
                return Err(parse_err("unexpected end of data while flipping"));
            }
            let len = data[pos] as usize;
            let sig_end = pos + 1 + len;
            if sig_end + 1 > data.len() {
                return Err(parse_err("variant signature extends past end of data"));
            }
            let inner = std::str::from_utf8(&data[pos + 1..sig_end])
                .map_err(|_| parse_err("variant signature is not ASCII"))?
                .to_string();
            let mut icur = SigCursor::new(&inner);
            let mut p = sig_end + 1;
            while !icur.at_end() {
                p = flip_one(data, p, &mut icur)?;
            }
            Ok(p)
        }
        TypeKind::String | TypeKind::ObjectPath => {
            cur.bump();
            let p = align_to(pos, 4);
            flip_slice(data, p, 4)?;
            let len = u32::from_ne_bytes(data[p..p + 4].try_into().unwrap()) as usize;
            let end = p + 4 + len + 1;
            if end > data.len() {
                return Err(parse_err("string extends past end of data"));
            }
            Ok(end)
        }
        TypeKind::Signature => {
            cur.bump();
            if pos >= data.len() {
                return Err(parse_err("unexpected end of data while flipping"));
            }
            let len = data[pos] as usize;
            let end = pos + 1 + len + 1;
            if end > data.len() {
                return Err(parse_err("signature extends past end of data"));
            }
            Ok(end)
        }
        fixed => {
            cur.bump();
            let size = fixed.fixed_size().unwrap_or(1);
            let p = align_to(pos, fixed.alignment());
            flip_slice(data, p, size)?;
            Ok(p + size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::MessageFactory;

    fn sample_call() -> Vec<u8> {
        let mut f = MessageFactory::method_call("/org/example/Obj", "Frob");
        f.set_interface("org.example.Iface");
        f.set_destination("org.example.Service");
        let args = f.args();
        args.append_u32(7).unwrap();
        args.append_string("hello").unwrap();
        args.begin_array().unwrap();
        args.append_u64(1).unwrap();
        args.append_u64(2).unwrap();
        args.end_array().unwrap();
        args.begin_variant("(is)").unwrap();
        args.begin_struct().unwrap();
        args.append_i32(-4).unwrap();
        args.append_string("v").unwrap();
        args.end_struct().unwrap();
        args.end_variant().unwrap();
        f.build(99).unwrap()
    }

    fn parse_message(bytes: Vec<u8>) -> Message {
        match parse(bytes).unwrap() {
            Parsed::Message(m) => m,
            Parsed::Ignored => panic!("message unexpectedly ignored"),
        }
    }

    #[test]
    fn size_matches_exactly() {
        let bytes = sample_call();
        assert_eq!(message_size(&bytes), Some(bytes.len()));
        assert_eq!(message_size(&bytes[..8]), None);
        // A truncated-but-readable prefix still reports the full size.
        assert_eq!(message_size(&bytes[..20]), Some(bytes.len()));
    }

    #[test]
    fn parse_extracts_header_fields() {
        let bytes = sample_call();
        let m = parse_message(bytes);
        assert_eq!(m.message_type, MessageType::MethodCall);
        assert_eq!(m.serial, 99);
        assert_eq!(m.path.as_deref(), Some("/org/example/Obj"));
        assert_eq!(m.member.as_deref(), Some("Frob"));
        assert_eq!(m.interface.as_deref(), Some("org.example.Iface"));
        assert_eq!(m.destination.as_deref(), Some("org.example.Service"));
        assert_eq!(m.signature.as_deref(), Some("usatv"));

        let mut it = m.args();
        assert_eq!(it.read_u32().unwrap(), 7);
        assert_eq!(it.read_string().unwrap(), "hello");
    }

    #[test]
    fn parse_preserves_wire_image() {
        let bytes = sample_call();
        let m = parse_message(bytes.clone());
        assert_eq!(m.as_bytes(), &bytes[..]);
    }

    #[test]
    fn foreign_endianness_is_normalized() {
        let bytes = sample_call();
        let native = parse_message(bytes.clone());

        // Re-encode the same logical message in the opposite endianness by
        // flipping a copy, then feed it back through the parser.
        let mut foreign = bytes.clone();
        flip_data(&mut foreign, HEADER_SIGNATURE).unwrap();
        let body_off = bytes.len() - native.body().len();
        flip_data(&mut foreign[body_off..], "usatv").unwrap();
        foreign[0] = if bytes[0] == LITTLE_ENDIAN {
            BIG_ENDIAN
        } else {
            LITTLE_ENDIAN
        };
        assert_ne!(foreign, bytes);

        let reparsed = parse_message(foreign);
        assert_eq!(reparsed, native);
        assert_eq!(reparsed.as_bytes(), native.as_bytes());
    }

    #[test]
    fn future_message_types_are_ignored() {
        let mut bytes = sample_call();
        bytes[1] = 9;
        assert!(matches!(parse(bytes).unwrap(), Parsed::Ignored));
    }

    #[test]
    fn invalid_type_is_rejected() {
        let mut bytes = sample_call();
        bytes[1] = 0;
        assert!(parse(bytes).is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut f = MessageFactory::new(MessageType::MethodReturn);
        // A method return without a reply serial violates the invariants;
        // the factory refuses to build it, and a hand-corrupted variant of
        // a valid message is refused by the parser.
        assert!(f.build(5).is_err());
    }

    #[test]
    fn unknown_header_field_is_skipped() {
        // Factory has no setter for unknown codes, so splice one in by hand:
        // take a valid message and rewrite the destination field code (6)
        // to an unassigned code.
        let bytes = sample_call();
        let m = parse_message(bytes.clone());
        let needle = m.destination.clone().unwrap();
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle.as_bytes())
            .unwrap();
        // code byte sits 8 bytes before the string: code, sig, padding, len.
        let mut patched = bytes.clone();
        let code_off = pos - 8;
        assert_eq!(patched[code_off], 6);
        patched[code_off] = 200;
        let m = parse_message(patched);
        assert_eq!(m.destination, None);
        assert_eq!(m.member.as_deref(), Some("Frob"));
    }

    #[test]
    fn string_args_sees_strings_only() {
        let bytes = sample_call();
        let m = parse_message(bytes);
        let args = m.string_args().unwrap();
        assert_eq!(args, vec![None, Some("hello"), None, None]);
    }

    #[test]
    fn object_path_shapes() {
        assert!(valid_object_path("/"));
        assert!(valid_object_path("/a/b_c/D9"));
        assert!(!valid_object_path(""));
        assert!(!valid_object_path("a/b"));
        assert!(!valid_object_path("/a/"));
        assert!(!valid_object_path("/a//b"));
        assert!(!valid_object_path("/a-b"));
    }
}
