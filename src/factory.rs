//! Mutable draft for assembling outgoing messages.
//!
//! A factory accumulates header fields and arguments, then renders the
//! final wire blob. The serial is normally assigned by the connection at
//! send time; callers that track replies reserve one up front with
//! [`MessageFactory::set_serial`].

use crate::buffer::Buffer;
use crate::error::*;
use crate::message::{
    self, Message, MessageType, FLAG_NO_AUTO_START, FLAG_NO_REPLY_EXPECTED, MAX_BODY_SIZE,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

pub struct MessageFactory {
    message_type: MessageType,
    flags: u8,
    serial: Option<u32>,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    args: Buffer,
}

impl MessageFactory {
    pub fn new(message_type: MessageType) -> MessageFactory {
        MessageFactory {
            message_type,
            flags: 0,
            serial: None,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            args: Buffer::new(),
        }
    }

    /// Draft for a method call to `path`/`member`.
    pub fn method_call(path: &str, member: &str) -> MessageFactory {
        let mut f = MessageFactory::new(MessageType::MethodCall);
        f.path = Some(path.to_string());
        f.member = Some(member.to_string());
        f
    }

    /// Draft for the return to `call`, addressed back to its sender.
    pub fn method_return(call: &Message) -> MessageFactory {
        let mut f = MessageFactory::new(MessageType::MethodReturn);
        f.reply_serial = Some(call.serial);
        f.destination = call.sender.clone();
        f
    }

    /// Draft for an error reply to `call`. A text argument is appended when
    /// `text` is given, matching the conventional `s` error body.
    pub fn error(call: &Message, name: &str, text: Option<&str>) -> Result<MessageFactory> {
        let mut f = MessageFactory::new(MessageType::Error);
        f.reply_serial = Some(call.serial);
        f.destination = call.sender.clone();
        f.error_name = Some(name.to_string());
        if let Some(text) = text {
            f.args.append_string(text)?;
        }
        Ok(f)
    }

    /// Draft for a signal emitted from `path`.
    pub fn signal(path: &str, interface: &str, member: &str) -> MessageFactory {
        let mut f = MessageFactory::new(MessageType::Signal);
        f.path = Some(path.to_string());
        f.interface = Some(interface.to_string());
        f.member = Some(member.to_string());
        f
    }

    pub fn set_path(&mut self, path: &str) -> &mut Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn set_interface(&mut self, interface: &str) -> &mut Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn set_member(&mut self, member: &str) -> &mut Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn set_error_name(&mut self, name: &str) -> &mut Self {
        self.error_name = Some(name.to_string());
        self
    }

    pub fn set_destination(&mut self, destination: &str) -> &mut Self {
        self.destination = Some(destination.to_string());
        self
    }

    /// Normally filled in by the bus daemon; useful when fabricating
    /// messages locally.
    pub fn set_sender(&mut self, sender: &str) -> &mut Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn set_reply_serial(&mut self, serial: u32) -> &mut Self {
        self.reply_serial = Some(serial);
        self
    }

    /// Reserves a specific serial instead of taking one at send time.
    pub fn set_serial(&mut self, serial: u32) -> &mut Self {
        self.serial = Some(serial);
        self
    }

    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    pub fn set_no_reply_expected(&mut self, on: bool) -> &mut Self {
        if on {
            self.flags |= FLAG_NO_REPLY_EXPECTED;
        } else {
            self.flags &= !FLAG_NO_REPLY_EXPECTED;
        }
        self
    }

    pub fn set_no_auto_start(&mut self, on: bool) -> &mut Self {
        if on {
            self.flags |= FLAG_NO_AUTO_START;
        } else {
            self.flags &= !FLAG_NO_AUTO_START;
        }
        self
    }

    /// Argument buffer; scoped borrow, released when the reference drops.
    pub fn args(&mut self) -> &mut Buffer {
        &mut self.args
    }

    fn check_invariants(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(context!(ErrorKind::InvalidMessage(format!(
                "{:?} message without {}",
                self.message_type, what
            ))))
        };
        match self.message_type {
            MessageType::Invalid => Err(context!(ErrorKind::InvalidMessage(
                "cannot build an Invalid message".into()
            ))),
            MessageType::MethodCall => {
                if self.path.is_none() || self.member.is_none() {
                    return missing("path or member");
                }
                Ok(())
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return missing("reply serial");
                }
                Ok(())
            }
            MessageType::Error => {
                if self.error_name.is_none() || self.reply_serial.is_none() {
                    return missing("error name or reply serial");
                }
                Ok(())
            }
            MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return missing("path, interface or member");
                }
                Ok(())
            }
        }
    }

    /// Renders the wire blob with the given serial.
    pub fn build(&mut self, serial: u32) -> Result<Vec<u8>> {
        self.check_invariants()?;
        if serial == 0 {
            return Err(context!(ErrorKind::InvalidMessage("serial 0".into())));
        }
        if !self.args.is_closed() {
            return Err(context!(ErrorKind::InvalidMessage(
                "unclosed container in arguments".into()
            )));
        }
        if self.args.len() > MAX_BODY_SIZE {
            return Err(context!(ErrorKind::MessageTooLarge(self.args.len())));
        }

        let mut h = Buffer::new();
        h.append_byte(message::native_endianness())?;
        h.append_byte(self.message_type.as_u8())?;
        h.append_byte(self.flags)?;
        h.append_byte(PROTOCOL_VERSION)?;
        h.append_u32(self.args.len() as u32)?;
        h.append_u32(serial)?;

        h.begin_array_with("(yv)")?;
        let mut string_field = |h: &mut Buffer, code: u8, sig: &str, value: &str| -> Result<()> {
            h.begin_struct()?;
            h.append_byte(code)?;
            h.begin_variant(sig)?;
            match sig {
                "o" => h.append_object_path(value)?,
                "g" => h.append_signature(value)?,
                _ => h.append_string(value)?,
            }
            h.end_variant()?;
            h.end_struct()?;
            Ok(())
        };
        if let Some(ref v) = self.path {
            string_field(&mut h, 1, "o", v)?;
        }
        if let Some(ref v) = self.interface {
            string_field(&mut h, 2, "s", v)?;
        }
        if let Some(ref v) = self.member {
            string_field(&mut h, 3, "s", v)?;
        }
        if let Some(ref v) = self.error_name {
            string_field(&mut h, 4, "s", v)?;
        }
        if let Some(v) = self.reply_serial {
            h.begin_struct()?;
            h.append_byte(5)?;
            h.begin_variant("u")?;
            h.append_u32(v)?;
            h.end_variant()?;
            h.end_struct()?;
        }
        if let Some(ref v) = self.destination {
            string_field(&mut h, 6, "s", v)?;
        }
        if let Some(ref v) = self.sender {
            string_field(&mut h, 7, "s", v)?;
        }
        if !self.args.is_empty() {
            string_field(&mut h, 8, "g", self.args.signature())?;
        }
        h.end_array()?;

        h.pad_to(8);
        h.extend_raw(self.args.data());
        let data = h.into_data();
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(context!(ErrorKind::MessageTooLarge(data.len())));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{message_size, parse, Parsed};

    #[test]
    fn return_mirrors_call() {
        let bytes = {
            let mut f = MessageFactory::method_call("/x", "M");
            f.set_sender(":1.7");
            f.build(41).unwrap()
        };
        let call = match parse(bytes).unwrap() {
            Parsed::Message(m) => m,
            _ => unreachable!(),
        };
        let mut r = MessageFactory::method_return(&call);
        r.args().append_u32(1).unwrap();
        let bytes = r.build(42).unwrap();
        let ret = match parse(bytes).unwrap() {
            Parsed::Message(m) => m,
            _ => unreachable!(),
        };
        assert_eq!(ret.message_type, MessageType::MethodReturn);
        assert_eq!(ret.reply_serial, Some(41));
        assert_eq!(ret.destination.as_deref(), Some(":1.7"));
    }

    #[test]
    fn error_carries_name_and_text() {
        let call = {
            let bytes = MessageFactory::method_call("/x", "M").build(5).unwrap();
            match parse(bytes).unwrap() {
                Parsed::Message(m) => m,
                _ => unreachable!(),
            }
        };
        let mut e = MessageFactory::error(&call, "org.example.Failed", Some("boom")).unwrap();
        let bytes = e.build(6).unwrap();
        let err = match parse(bytes).unwrap() {
            Parsed::Message(m) => m,
            _ => unreachable!(),
        };
        assert_eq!(err.message_type, MessageType::Error);
        assert_eq!(err.error_name.as_deref(), Some("org.example.Failed"));
        assert_eq!(err.reply_serial, Some(5));
        assert_eq!(err.args().read_string().unwrap(), "boom");
    }

    #[test]
    fn invariants_enforced() {
        assert!(MessageFactory::new(MessageType::MethodCall).build(1).is_err());
        assert!(MessageFactory::new(MessageType::Error).build(1).is_err());
        assert!(MessageFactory::new(MessageType::Invalid).build(1).is_err());
        assert!(MessageFactory::method_call("/x", "M").build(0).is_err());
    }

    #[test]
    fn unclosed_args_refused() {
        let mut f = MessageFactory::method_call("/x", "M");
        f.args().begin_struct().unwrap();
        assert!(f.build(1).is_err());
    }

    #[test]
    fn size_of_built_message_is_exact() {
        let mut f = MessageFactory::signal("/sig", "org.example.S", "Changed");
        f.args().append_string("odd-length-string!").unwrap();
        f.args().append_byte(3).unwrap();
        let bytes = f.build(17).unwrap();
        assert_eq!(message_size(&bytes), Some(bytes.len()));
    }

    #[test]
    fn no_signature_field_for_empty_body() {
        let bytes = MessageFactory::method_call("/x", "M").build(3).unwrap();
        let m = match parse(bytes).unwrap() {
            Parsed::Message(m) => m,
            _ => unreachable!(),
        };
        assert_eq!(m.signature, None);
        assert!(m.body().is_empty());
    }
}
