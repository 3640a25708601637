//! Signature-synthesizing encoder for argument blobs and headers.
//!
//! Append calls mirror the iterator's read calls. The signature of the
//! accumulated data is synthesized from the calls made, not declared up
//! front; inside arrays and variants, where the element type is already
//! fixed, a parallel cursor verifies that further appends keep matching it.
//! Alignment padding is written as zero bytes. Arrays are written with a
//! two-pass length fixup: four bytes are reserved, elements are written,
//! and the length is backpatched on [`Buffer::end_array`].

use crate::error::*;
use crate::iter::MAX_ARRAY_SIZE;
use crate::message;
use crate::signature::{self, SigCursor, TypeKind, MAX_SIGNATURE};

enum Scope {
    Array {
        len_off: usize,
        start: Option<usize>,
        elem: String,
        complete: bool,
        check: usize,
    },
    Struct {
        wrote: bool,
    },
    DictEntry,
    Variant {
        expect: String,
        check: usize,
    },
}

/// Append-only buffer producing a well-aligned argument blob plus its
/// signature.
#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    sig: String,
    scopes: Vec<Scope>,
}

fn elem_alignment(elem: &str) -> Result<usize> {
    SigCursor::new(elem)
        .peek()
        .map(TypeKind::alignment)
        .ok_or_else(|| context!(ErrorKind::InvalidSignature(elem.into())))
}

fn mismatch(expect: &str, got: &str) -> Error {
    context!(ErrorKind::InvalidSignature(format!(
        "appended '{}' where '{}' is required",
        got, expect
    )))
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// Signature of everything appended so far.
    pub fn signature(&self) -> &str {
        &self.sig
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True once every container has been closed.
    pub fn is_closed(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Routes a signature fragment through the open container scopes: scopes
    /// with a fixed element type verify it, inferring scopes record it and
    /// pass it outward, the top level appends it.
    fn sig_put(&mut self, s: &str) -> Result<()> {
        for scope in self.scopes.iter_mut().rev() {
            match scope {
                Scope::Struct { wrote } => {
                    *wrote = true;
                }
                Scope::DictEntry => {}
                Scope::Variant { expect, check } => {
                    for &c in s.as_bytes() {
                        if expect.as_bytes().get(*check) != Some(&c) {
                            return Err(mismatch(expect, s));
                        }
                        *check += 1;
                    }
                    return Ok(());
                }
                Scope::Array {
                    elem,
                    complete,
                    check,
                    ..
                } => {
                    if *complete {
                        for &c in s.as_bytes() {
                            if *check == elem.len() {
                                *check = 0;
                            }
                            if elem.as_bytes().get(*check) != Some(&c) {
                                return Err(mismatch(elem, s));
                            }
                            *check += 1;
                        }
                        return Ok(());
                    }
                    elem.push_str(s);
                    if signature::is_single_complete(elem, true) {
                        *complete = true;
                        *check = elem.len();
                    }
                }
            }
        }
        self.sig.push_str(s);
        if self.sig.len() > MAX_SIGNATURE {
            return Err(context!(ErrorKind::InvalidSignature(
                "signature exceeds 255 bytes".into()
            )));
        }
        Ok(())
    }

    fn pad_raw(&mut self, align: usize) {
        while self.data.len() % align != 0 {
            self.data.push(0);
        }
    }

    /// Aligns and appends raw value bytes, first fixing up the element
    /// padding of any enclosing array that has not seen data yet. Returns
    /// the offset the bytes were written at.
    fn emit(&mut self, align: usize, bytes: &[u8]) -> Result<usize> {
        for i in 0..self.scopes.len() {
            let pending = match &self.scopes[i] {
                Scope::Array {
                    start: None, elem, ..
                } => Some(elem_alignment(elem)?),
                _ => None,
            };
            if let Some(a) = pending {
                self.pad_raw(a);
                if let Scope::Array { start, .. } = &mut self.scopes[i] {
                    *start = Some(self.data.len());
                }
            }
        }
        self.pad_raw(align);
        let off = self.data.len();
        self.data.extend_from_slice(bytes);
        Ok(off)
    }

    pub fn append_byte(&mut self, v: u8) -> Result<()> {
        self.sig_put("y")?;
        self.emit(1, &[v]).map(drop)
    }

    pub fn append_bool(&mut self, v: bool) -> Result<()> {
        self.sig_put("b")?;
        self.emit(4, &(v as u32).to_ne_bytes()).map(drop)
    }

    pub fn append_i16(&mut self, v: i16) -> Result<()> {
        self.sig_put("n")?;
        self.emit(2, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_u16(&mut self, v: u16) -> Result<()> {
        self.sig_put("q")?;
        self.emit(2, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_i32(&mut self, v: i32) -> Result<()> {
        self.sig_put("i")?;
        self.emit(4, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_u32(&mut self, v: u32) -> Result<()> {
        self.sig_put("u")?;
        self.emit(4, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_i64(&mut self, v: i64) -> Result<()> {
        self.sig_put("x")?;
        self.emit(8, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_u64(&mut self, v: u64) -> Result<()> {
        self.sig_put("t")?;
        self.emit(8, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_double(&mut self, v: f64) -> Result<()> {
        self.sig_put("d")?;
        self.emit(8, &v.to_ne_bytes()).map(drop)
    }

    pub fn append_unix_fd(&mut self, index: u32) -> Result<()> {
        self.sig_put("h")?;
        self.emit(4, &index.to_ne_bytes()).map(drop)
    }

    fn append_string_body(&mut self, s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(context!(ErrorKind::InvalidMessage(
                "string contains nul".into()
            )));
        }
        self.emit(4, &(s.len() as u32).to_ne_bytes())?;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        Ok(())
    }

    pub fn append_string(&mut self, s: &str) -> Result<()> {
        self.sig_put("s")?;
        self.append_string_body(s)
    }

    pub fn append_object_path(&mut self, path: &str) -> Result<()> {
        if !message::valid_object_path(path) {
            return Err(context!(ErrorKind::InvalidMessage(format!(
                "malformed object path '{}'",
                path
            ))));
        }
        self.sig_put("o")?;
        self.append_string_body(path)
    }

    pub fn append_signature(&mut self, sig: &str) -> Result<()> {
        signature::validate(sig)?;
        self.sig_put("g")?;
        self.emit(1, &[sig.len() as u8])?;
        self.data.extend_from_slice(sig.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// Opens an array whose element type is inferred from the first element.
    /// An array closed without elements must use [`Buffer::begin_array_with`]
    /// instead, since nothing else pins down its element type.
    pub fn begin_array(&mut self) -> Result<()> {
        self.sig_put("a")?;
        let len_off = self.emit(4, &[0u8; 4])?;
        self.scopes.push(Scope::Array {
            len_off,
            start: None,
            elem: String::new(),
            complete: false,
            check: 0,
        });
        Ok(())
    }

    /// Opens an array with a declared element type.
    pub fn begin_array_with(&mut self, elem: &str) -> Result<()> {
        if !signature::is_single_complete(elem, true) {
            return Err(context!(ErrorKind::InvalidSignature(elem.into())));
        }
        self.sig_put("a")?;
        self.sig_put(elem)?;
        let len_off = self.emit(4, &[0u8; 4])?;
        self.scopes.push(Scope::Array {
            len_off,
            start: None,
            elem: elem.to_string(),
            complete: true,
            check: elem.len(),
        });
        Ok(())
    }

    /// Closes the innermost array and backpatches its length.
    pub fn end_array(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::Array {
                len_off,
                start,
                elem,
                complete,
                check,
            }) => {
                if !complete {
                    return Err(context!(ErrorKind::InvalidSignature(if elem.is_empty() {
                        "array element type undetermined".into()
                    } else {
                        format!("array element '{}' incomplete", elem)
                    })));
                }
                if check != 0 && check != elem.len() {
                    return Err(context!(ErrorKind::InvalidSignature(format!(
                        "array element '{}' incomplete",
                        elem
                    ))));
                }
                let start = match start {
                    Some(s) => s,
                    None => {
                        // No element was written; the padding after the
                        // length still depends on the element alignment.
                        self.pad_raw(elem_alignment(&elem)?);
                        self.data.len()
                    }
                };
                let len = self.data.len() - start;
                if len > MAX_ARRAY_SIZE {
                    return Err(context!(ErrorKind::MessageTooLarge(len)));
                }
                self.data[len_off..len_off + 4].copy_from_slice(&(len as u32).to_ne_bytes());
                Ok(())
            }
            _ => Err(context!(ErrorKind::InvalidMessage(
                "end_array outside an array".into()
            ))),
        }
    }

    pub fn begin_struct(&mut self) -> Result<()> {
        self.sig_put("(")?;
        self.emit(8, &[])?;
        self.scopes.push(Scope::Struct { wrote: false });
        Ok(())
    }

    pub fn end_struct(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::Struct { wrote: true }) => self.sig_put(")"),
            Some(Scope::Struct { wrote: false }) => Err(context!(ErrorKind::InvalidSignature(
                "empty struct".into()
            ))),
            _ => Err(context!(ErrorKind::InvalidMessage(
                "end_struct outside a struct".into()
            ))),
        }
    }

    /// Opens a dict entry; legal only directly inside an array.
    pub fn begin_dict_entry(&mut self) -> Result<()> {
        if !matches!(self.scopes.last(), Some(Scope::Array { .. })) {
            return Err(context!(ErrorKind::InvalidSignature(
                "dict entry outside an array".into()
            )));
        }
        self.sig_put("{")?;
        self.emit(8, &[])?;
        self.scopes.push(Scope::DictEntry);
        Ok(())
    }

    pub fn end_dict_entry(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::DictEntry) => self.sig_put("}"),
            _ => Err(context!(ErrorKind::InvalidMessage(
                "end_dict_entry outside a dict entry".into()
            ))),
        }
    }

    /// Opens a variant. The embedded signature is written immediately;
    /// appends up to [`Buffer::end_variant`] must produce exactly one value
    /// of that type.
    pub fn begin_variant(&mut self, inner: &str) -> Result<()> {
        if !signature::is_single_complete(inner, false) {
            return Err(context!(ErrorKind::InvalidSignature(inner.into())));
        }
        self.sig_put("v")?;
        let mut head = Vec::with_capacity(inner.len() + 2);
        head.push(inner.len() as u8);
        head.extend_from_slice(inner.as_bytes());
        head.push(0);
        self.emit(1, &head)?;
        self.scopes.push(Scope::Variant {
            expect: inner.to_string(),
            check: 0,
        });
        Ok(())
    }

    pub fn end_variant(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::Variant { expect, check }) => {
                if check != expect.len() {
                    return Err(context!(ErrorKind::InvalidSignature(format!(
                        "variant value '{}' incomplete",
                        expect
                    ))));
                }
                Ok(())
            }
            _ => Err(context!(ErrorKind::InvalidMessage(
                "end_variant outside a variant".into()
            ))),
        }
    }

    /// Zero-pads up to the next `align` boundary.
    pub(crate) fn pad_to(&mut self, align: usize) {
        self.pad_raw(align);
    }

    /// Appends pre-encoded bytes without touching the signature.
    pub(crate) fn extend_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_zeroed() {
        let mut b = Buffer::new();
        b.append_byte(0xff).unwrap();
        b.append_u64(1).unwrap();
        assert_eq!(b.signature(), "yt");
        assert_eq!(&b.data()[1..8], &[0u8; 7]);
        assert_eq!(b.len(), 16);
    }

    #[test]
    fn array_length_backpatched() {
        let mut b = Buffer::new();
        b.begin_array().unwrap();
        b.append_u32(1).unwrap();
        b.append_u32(2).unwrap();
        b.end_array().unwrap();
        assert_eq!(b.signature(), "au");
        let len = u32::from_ne_bytes(b.data()[0..4].try_into().unwrap());
        assert_eq!(len, 8);
    }

    #[test]
    fn array_of_u64_pads_before_elements() {
        let mut b = Buffer::new();
        b.begin_array().unwrap();
        b.append_u64(0x0102_0304_0506_0708).unwrap();
        b.end_array().unwrap();
        // 4 length bytes, 4 padding bytes, 8 element bytes
        assert_eq!(b.len(), 16);
        let len = u32::from_ne_bytes(b.data()[0..4].try_into().unwrap());
        assert_eq!(len, 8);
    }

    #[test]
    fn empty_array_needs_declared_element() {
        let mut b = Buffer::new();
        b.begin_array().unwrap();
        assert!(b.end_array().is_err());

        let mut b = Buffer::new();
        b.begin_array_with("t").unwrap();
        b.end_array().unwrap();
        assert_eq!(b.signature(), "at");
        // length plus padding to the 8-byte element boundary
        assert_eq!(b.len(), 8);
    }

    #[test]
    fn nested_synthesis() {
        let mut b = Buffer::new();
        b.begin_array().unwrap();
        b.begin_dict_entry().unwrap();
        b.append_string("key").unwrap();
        b.begin_variant("au").unwrap();
        b.begin_array().unwrap();
        b.append_u32(1).unwrap();
        b.end_array().unwrap();
        b.end_variant().unwrap();
        b.end_dict_entry().unwrap();
        b.end_array().unwrap();
        assert_eq!(b.signature(), "a{sv}");
        assert!(b.is_closed());
    }

    #[test]
    fn second_element_must_match_first() {
        let mut b = Buffer::new();
        b.begin_array().unwrap();
        b.append_string("one").unwrap();
        assert!(b.append_u32(2).is_err());
    }

    #[test]
    fn variant_content_checked() {
        let mut b = Buffer::new();
        b.begin_variant("s").unwrap();
        assert!(b.append_u32(1).is_err());

        let mut b = Buffer::new();
        b.begin_variant("s").unwrap();
        assert!(b.end_variant().is_err());
    }

    #[test]
    fn struct_must_have_members() {
        let mut b = Buffer::new();
        b.begin_struct().unwrap();
        assert!(b.end_struct().is_err());
    }

    #[test]
    fn dict_entry_requires_array() {
        let mut b = Buffer::new();
        assert!(b.begin_dict_entry().is_err());
    }

    #[test]
    fn declared_array_checks_elements() {
        let mut b = Buffer::new();
        b.begin_array_with("(ys)").unwrap();
        b.begin_struct().unwrap();
        b.append_byte(1).unwrap();
        b.append_string("x").unwrap();
        b.end_struct().unwrap();
        b.end_array().unwrap();
        assert_eq!(b.signature(), "a(ys)");

        let mut b = Buffer::new();
        b.begin_array_with("(ys)").unwrap();
        b.begin_struct().unwrap();
        assert!(b.append_u32(1).is_err());
    }
}
