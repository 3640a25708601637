//! Signature-driven decoding of argument blobs.
//!
//! An [`Iter`] walks a byte region produced by the wire codec, yielding one
//! typed value per call. Alignment is computed from the byte offset relative
//! to the start of the region, which the codec guarantees coincides with an
//! 8-byte boundary of the enclosing message.

use crate::error::*;
use crate::message;
use crate::signature::{self, SigCursor, TypeKind};

/// Largest single array the wire format permits (64 MiB).
pub const MAX_ARRAY_SIZE: usize = 64 * 1024 * 1024;

fn truncated() -> Error {
    context!(ErrorKind::Parse("unexpected end of data".into()))
}

/// Decoding cursor over an argument blob.
pub struct Iter<'a> {
    data: &'a [u8],
    pos: usize,
    sig: SigCursor<'a>,
}

/// State for iterating one array; returned by [`Iter::begin_array`].
pub struct ArrayIter {
    end: usize,
    elem_start: usize,
    elem_end: usize,
}

/// State for one variant; returned by [`Iter::begin_variant`].
pub struct VariantIter<'a> {
    saved: SigCursor<'a>,
}

impl<'a> Iter<'a> {
    /// Starts decoding `sig`-typed values at `offset` within `data`.
    pub fn new(data: &'a [u8], offset: usize, sig: &'a str) -> Iter<'a> {
        Iter {
            data,
            pos: offset,
            sig: SigCursor::new(sig),
        }
    }

    /// Kind of the next value, `None` when the signature is exhausted.
    pub fn peek(&self) -> Option<TypeKind> {
        self.sig.peek()
    }

    pub fn at_end(&self) -> bool {
        self.sig.at_end()
    }

    /// Remaining signature, mostly useful in error reports.
    pub fn signature_rest(&self) -> &'a str {
        self.sig.rest()
    }

    /// Current byte offset within the blob.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn align(&mut self, n: usize) -> Result<()> {
        let aligned = (self.pos + n - 1) & !(n - 1);
        if aligned > self.data.len() {
            return Err(truncated());
        }
        self.pos = aligned;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.data.len() {
            return Err(truncated());
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn fixed(&mut self, kind: TypeKind) -> Result<&'a [u8]> {
        self.sig.advance_atomic(kind)?;
        self.align(kind.alignment())?;
        self.take(kind.fixed_size().unwrap_or(0))
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.fixed(TypeKind::Byte)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let raw = u32::from_ne_bytes(self.fixed(TypeKind::Bool)?.try_into().unwrap());
        match raw {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(context!(ErrorKind::Parse(format!("invalid boolean {}", v)))),
        }
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_ne_bytes(
            self.fixed(TypeKind::Int16)?.try_into().unwrap(),
        ))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(
            self.fixed(TypeKind::UInt16)?.try_into().unwrap(),
        ))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(
            self.fixed(TypeKind::Int32)?.try_into().unwrap(),
        ))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(
            self.fixed(TypeKind::UInt32)?.try_into().unwrap(),
        ))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_ne_bytes(
            self.fixed(TypeKind::Int64)?.try_into().unwrap(),
        ))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(
            self.fixed(TypeKind::UInt64)?.try_into().unwrap(),
        ))
    }

    pub fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_ne_bytes(
            self.fixed(TypeKind::Double)?.try_into().unwrap(),
        ))
    }

    /// File descriptor index. Descriptors themselves travel out of band and
    /// are not handled here.
    pub fn read_unix_fd(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(
            self.fixed(TypeKind::UnixFd)?.try_into().unwrap(),
        ))
    }

    fn string_body(&mut self) -> Result<&'a str> {
        self.align(4)?;
        let len = u32::from_ne_bytes(self.take(4)?.try_into().unwrap()) as usize;
        let raw = self.take(len + 1)?;
        if raw[len] != 0 {
            return Err(context!(ErrorKind::Parse(
                "string missing nul terminator".into()
            )));
        }
        let s = std::str::from_utf8(&raw[..len])
            .map_err(|_| context!(ErrorKind::Parse("string is not valid UTF-8".into())))?;
        if s.contains('\0') {
            return Err(context!(ErrorKind::Parse("string contains nul".into())));
        }
        Ok(s)
    }

    pub fn read_string(&mut self) -> Result<&'a str> {
        self.sig.advance_atomic(TypeKind::String)?;
        self.string_body()
    }

    pub fn read_object_path(&mut self) -> Result<&'a str> {
        self.sig.advance_atomic(TypeKind::ObjectPath)?;
        let s = self.string_body()?;
        if !message::valid_object_path(s) {
            return Err(context!(ErrorKind::Parse(format!(
                "malformed object path '{}'",
                s
            ))));
        }
        Ok(s)
    }

    fn signature_body(&mut self) -> Result<&'a str> {
        let len = self.take(1)?[0] as usize;
        let raw = self.take(len + 1)?;
        if raw[len] != 0 {
            return Err(context!(ErrorKind::Parse(
                "signature missing nul terminator".into()
            )));
        }
        let s = std::str::from_utf8(&raw[..len])
            .map_err(|_| context!(ErrorKind::Parse("signature is not ASCII".into())))?;
        signature::validate(s)?;
        Ok(s)
    }

    pub fn read_signature(&mut self) -> Result<&'a str> {
        self.sig.advance_atomic(TypeKind::Signature)?;
        self.signature_body()
    }

    /// Enters an array. Iterate with [`Iter::more_in_array`] and finish with
    /// [`Iter::end_array`].
    pub fn begin_array(&mut self) -> Result<ArrayIter> {
        self.sig.advance_atomic(TypeKind::Array)?;
        let elem_start = self.sig.position();
        let elem = self.sig.complete_type(true)?;
        let elem_kind = SigCursor::new(elem).peek().ok_or_else(|| {
            context!(ErrorKind::InvalidSignature(elem.into()))
        })?;
        self.align(4)?;
        let len = u32::from_ne_bytes(self.take(4)?.try_into().unwrap()) as usize;
        if len > MAX_ARRAY_SIZE {
            return Err(context!(ErrorKind::Parse(format!(
                "array of {} bytes exceeds limit",
                len
            ))));
        }
        self.align(elem_kind.alignment())?;
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        if end > self.data.len() {
            return Err(truncated());
        }
        Ok(ArrayIter {
            end,
            elem_start,
            elem_end: elem_start + elem.len(),
        })
    }

    /// True while array data remains; rewinds the signature cursor to the
    /// element type so the caller can decode the next element.
    pub fn more_in_array(&mut self, a: &ArrayIter) -> bool {
        if self.pos < a.end {
            self.sig.set_position(a.elem_start);
            true
        } else {
            false
        }
    }

    pub fn end_array(&mut self, a: ArrayIter) -> Result<()> {
        if self.pos != a.end {
            return Err(context!(ErrorKind::Parse(
                "array length does not match element data".into()
            )));
        }
        self.sig.set_position(a.elem_end);
        Ok(())
    }

    pub fn begin_struct(&mut self) -> Result<()> {
        self.sig.advance_atomic(TypeKind::Struct)?;
        self.align(8)
    }

    pub fn end_struct(&mut self) -> Result<()> {
        if self.sig.peek_code() == Some(b')') {
            self.sig.bump();
            Ok(())
        } else {
            Err(context!(ErrorKind::Parse("struct fields remaining".into())))
        }
    }

    pub fn begin_dict_entry(&mut self) -> Result<()> {
        self.sig.advance_atomic(TypeKind::DictEntry)?;
        self.align(8)
    }

    pub fn end_dict_entry(&mut self) -> Result<()> {
        if self.sig.peek_code() == Some(b'}') {
            self.sig.bump();
            Ok(())
        } else {
            Err(context!(ErrorKind::Parse(
                "dict entry fields remaining".into()
            )))
        }
    }

    /// Enters a variant, switching the cursor to the embedded signature.
    pub fn begin_variant(&mut self) -> Result<VariantIter<'a>> {
        self.sig.advance_atomic(TypeKind::Variant)?;
        let inner = self.signature_body()?;
        if !signature::is_single_complete(inner, false) {
            return Err(context!(ErrorKind::Parse(format!(
                "variant signature '{}' is not a single complete type",
                inner
            ))));
        }
        let saved = std::mem::replace(&mut self.sig, SigCursor::new(inner));
        Ok(VariantIter { saved })
    }

    pub fn end_variant(&mut self, v: VariantIter<'a>) -> Result<()> {
        if !self.sig.at_end() {
            return Err(context!(ErrorKind::Parse(
                "variant value not fully consumed".into()
            )));
        }
        self.sig = v.saved;
        Ok(())
    }

    /// Skips one complete value of whatever type the signature names next.
    pub fn skip_value(&mut self) -> Result<()> {
        let kind = self.sig.peek().ok_or_else(|| {
            context!(ErrorKind::InvalidSignature(self.sig.rest().into()))
        })?;
        match kind {
            TypeKind::String => {
                self.sig.advance_atomic(TypeKind::String)?;
                self.string_body()?;
            }
            TypeKind::ObjectPath => {
                self.read_object_path()?;
            }
            TypeKind::Signature => {
                self.read_signature()?;
            }
            TypeKind::Array => {
                let a = self.begin_array()?;
                self.pos = a.end;
                self.sig.set_position(a.elem_end);
            }
            TypeKind::Struct => {
                self.begin_struct()?;
                while self.sig.peek_code() != Some(b')') {
                    self.skip_value()?;
                }
                self.end_struct()?;
            }
            TypeKind::DictEntry => {
                self.begin_dict_entry()?;
                self.skip_value()?;
                self.skip_value()?;
                self.end_dict_entry()?;
            }
            TypeKind::Variant => {
                let v = self.begin_variant()?;
                while !self.sig.at_end() {
                    self.skip_value()?;
                }
                self.end_variant(v)?;
            }
            fixed => {
                self.fixed(fixed)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    fn decode(buf: &Buffer) -> Iter<'_> {
        Iter::new(buf.data(), 0, buf.signature())
    }

    #[test]
    fn fixed_width_values() {
        let mut b = Buffer::new();
        b.append_byte(7).unwrap();
        b.append_u32(0xdead_beef).unwrap();
        b.append_i16(-2).unwrap();
        b.append_u64(u64::MAX).unwrap();
        b.append_double(1.5).unwrap();
        b.append_bool(true).unwrap();

        let mut it = decode(&b);
        assert_eq!(it.read_byte().unwrap(), 7);
        assert_eq!(it.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(it.read_i16().unwrap(), -2);
        assert_eq!(it.read_u64().unwrap(), u64::MAX);
        assert_eq!(it.read_double().unwrap(), 1.5);
        assert!(it.read_bool().unwrap());
        assert!(it.at_end());
    }

    #[test]
    fn strings_and_paths() {
        let mut b = Buffer::new();
        b.append_string("hello world").unwrap();
        b.append_object_path("/org/example/Path").unwrap();
        b.append_signature("a{sv}").unwrap();

        let mut it = decode(&b);
        assert_eq!(it.read_string().unwrap(), "hello world");
        assert_eq!(it.read_object_path().unwrap(), "/org/example/Path");
        assert_eq!(it.read_signature().unwrap(), "a{sv}");
    }

    #[test]
    fn array_of_struct() {
        let mut b = Buffer::new();
        b.begin_array().unwrap();
        for (x, s) in [(1i32, "one"), (2, "two")] {
            b.begin_struct().unwrap();
            b.append_i32(x).unwrap();
            b.append_string(s).unwrap();
            b.end_struct().unwrap();
        }
        b.end_array().unwrap();
        assert_eq!(b.signature(), "a(is)");

        let mut it = decode(&b);
        let a = it.begin_array().unwrap();
        let mut seen = Vec::new();
        while it.more_in_array(&a) {
            it.begin_struct().unwrap();
            let x = it.read_i32().unwrap();
            let s = it.read_string().unwrap().to_string();
            it.end_struct().unwrap();
            seen.push((x, s));
        }
        it.end_array(a).unwrap();
        assert_eq!(seen, vec![(1, "one".into()), (2, "two".into())]);
    }

    #[test]
    fn variant_round_trip() {
        let mut b = Buffer::new();
        b.begin_variant("u").unwrap();
        b.append_u32(42).unwrap();
        b.end_variant().unwrap();
        assert_eq!(b.signature(), "v");

        let mut it = decode(&b);
        let v = it.begin_variant().unwrap();
        assert_eq!(it.read_u32().unwrap(), 42);
        it.end_variant(v).unwrap();
    }

    #[test]
    fn skip_over_everything() {
        let mut b = Buffer::new();
        b.append_string("skipped").unwrap();
        b.begin_array().unwrap();
        b.begin_dict_entry().unwrap();
        b.append_string("k").unwrap();
        b.begin_variant("i").unwrap();
        b.append_i32(-1).unwrap();
        b.end_variant().unwrap();
        b.end_dict_entry().unwrap();
        b.end_array().unwrap();
        b.append_u64(9).unwrap();

        let mut it = decode(&b);
        it.skip_value().unwrap();
        it.skip_value().unwrap();
        assert_eq!(it.read_u64().unwrap(), 9);
        assert!(it.at_end());
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut b = Buffer::new();
        b.append_string("hello").unwrap();
        let data = &b.data()[..b.data().len() - 3];
        let mut it = Iter::new(data, 0, "s");
        assert!(it.read_string().is_err());
    }

    #[test]
    fn wrong_type_is_an_error() {
        let mut b = Buffer::new();
        b.append_u32(1).unwrap();
        let mut it = decode(&b);
        assert!(it.read_string().is_err());
    }

    #[test]
    fn bogus_bool_rejected() {
        let data = 7u32.to_ne_bytes();
        let mut it = Iter::new(&data, 0, "b");
        assert!(it.read_bool().is_err());
    }

    #[test]
    fn empty_array_skips_cleanly() {
        let mut b = Buffer::new();
        b.begin_array_with("(ss)").unwrap();
        b.end_array().unwrap();
        assert_eq!(b.signature(), "a(ss)");

        let mut it = decode(&b);
        let a = it.begin_array().unwrap();
        assert!(!it.more_in_array(&a));
        it.end_array(a).unwrap();
        assert!(it.at_end());
    }
}
