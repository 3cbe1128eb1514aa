//! Message frames: the fixed prologue, the header-field array and the body.

use std::{borrow::Cow, collections::VecDeque, os::fd::OwnedFd};

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::{
    error::ProtocolError,
    marshal::{signature_text, Arg, CompoundArg, Decoder, Encoder, Endian, Kind, SimpleArg},
};

pub const PROTOCOL_VERSION: u8 = 1;

/// Frames may be at most 128 MiB.
pub const MAX_MESSAGE: usize = 1 << 27;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// The header fields a frame may carry, one slot per field code. Unknown
/// codes are dropped on receive and never emitted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    pub path: Option<Cow<'static, str>>,
    pub interface: Option<Cow<'static, str>>,
    pub member: Option<Cow<'static, str>>,
    pub error_name: Option<Cow<'static, str>>,
    pub reply_serial: Option<u32>,
    pub destination: Option<Cow<'static, str>>,
    pub sender: Option<String>,
    pub signature: Option<Vec<Kind>>,
    pub unix_fds: Option<u32>,
}

fn field_array_kind() -> Kind {
    Kind::Array(Box::new(Kind::Struct(vec![Kind::Byte, Kind::Variant])))
}

fn field(code: FieldCode, val: SimpleArg) -> Arg {
    Arg::Compound(CompoundArg::Struct(vec![
        Arg::Simple(SimpleArg::Byte(code as u8)),
        Arg::Compound(CompoundArg::Variant(Box::new(Arg::Simple(val)))),
    ]))
}

impl Headers {
    fn to_fields(&self) -> Arg {
        let mut fields = Vec::new();
        if let Some(val) = &self.path {
            fields.push(field(FieldCode::Path, SimpleArg::ObjPath(val.clone())));
        }
        if let Some(val) = &self.interface {
            fields.push(field(FieldCode::Interface, SimpleArg::String(val.clone())));
        }
        if let Some(val) = &self.member {
            fields.push(field(FieldCode::Member, SimpleArg::String(val.clone())));
        }
        if let Some(val) = &self.error_name {
            fields.push(field(FieldCode::ErrorName, SimpleArg::String(val.clone())));
        }
        if let Some(val) = self.reply_serial {
            fields.push(field(FieldCode::ReplySerial, SimpleArg::U32(val)));
        }
        if let Some(val) = &self.destination {
            fields.push(field(FieldCode::Destination, SimpleArg::String(val.clone())));
        }
        if let Some(val) = &self.sender {
            fields.push(field(FieldCode::Sender, SimpleArg::String(Cow::Owned(val.clone()))));
        }
        if let Some(val) = &self.signature {
            fields.push(field(FieldCode::Signature, SimpleArg::Signature(val.clone())));
        }
        if let Some(val) = self.unix_fds {
            fields.push(field(FieldCode::UnixFds, SimpleArg::U32(val)));
        }
        Arg::Compound(CompoundArg::Array(Kind::Struct(vec![Kind::Byte, Kind::Variant]), fields))
    }

    fn from_fields(arg: Arg) -> Result<Self, ProtocolError> {
        let Arg::Compound(CompoundArg::Array(.., entries)) = arg else {
            return Err(ProtocolError::BadHeader("field array has the wrong shape"));
        };

        let mut headers = Headers::default();
        for entry in entries {
            let Arg::Compound(CompoundArg::Struct(fields)) = entry else {
                return Err(ProtocolError::BadHeader("field array has the wrong shape"));
            };
            let mut fields = fields.into_iter();
            let (Some(Arg::Simple(SimpleArg::Byte(code))), Some(Arg::Compound(CompoundArg::Variant(val)))) =
                (fields.next(), fields.next())
            else {
                return Err(ProtocolError::BadHeader("field array has the wrong shape"));
            };

            let wrong = ProtocolError::BadHeader("field value has the wrong type");
            match code {
                1 => match *val {
                    Arg::Simple(SimpleArg::ObjPath(v)) => headers.path = Some(v),
                    _ => return Err(wrong),
                },
                2 => match *val {
                    Arg::Simple(SimpleArg::String(v)) => headers.interface = Some(v),
                    _ => return Err(wrong),
                },
                3 => match *val {
                    Arg::Simple(SimpleArg::String(v)) => headers.member = Some(v),
                    _ => return Err(wrong),
                },
                4 => match *val {
                    Arg::Simple(SimpleArg::String(v)) => headers.error_name = Some(v),
                    _ => return Err(wrong),
                },
                5 => match *val {
                    Arg::Simple(SimpleArg::U32(v)) => headers.reply_serial = Some(v),
                    _ => return Err(wrong),
                },
                6 => match *val {
                    Arg::Simple(SimpleArg::String(v)) => headers.destination = Some(v),
                    _ => return Err(wrong),
                },
                7 => match *val {
                    Arg::Simple(SimpleArg::String(v)) => headers.sender = Some(v.into_owned()),
                    _ => return Err(wrong),
                },
                8 => match *val {
                    Arg::Simple(SimpleArg::Signature(v)) => headers.signature = Some(v),
                    _ => return Err(wrong),
                },
                9 => match *val {
                    Arg::Simple(SimpleArg::U32(v)) => headers.unix_fds = Some(v),
                    _ => return Err(wrong),
                },
                _ => {} // unknown codes are ignored
            }
        }
        Ok(headers)
    }
}

/// One complete D-Bus frame.
#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    /// nonzero, allocated by the connection just before sending
    pub serial: u32,
    pub headers: Headers,
    pub body: Vec<Arg>,
}

impl Message {
    pub fn method_call<S1, S2, S3, S4>(dest: S1, path: S2, iface: S3, member: S4) -> Self
    where
        S1: Into<Cow<'static, str>>,
        S2: Into<Cow<'static, str>>,
        S3: Into<Cow<'static, str>>,
        S4: Into<Cow<'static, str>>,
    {
        Self {
            kind: MessageKind::MethodCall,
            flags: MessageFlags::empty(),
            serial: 0,
            headers: Headers {
                path: Some(path.into()),
                interface: Some(iface.into()),
                member: Some(member.into()),
                destination: Some(dest.into()),
                ..Headers::default()
            },
            body: Vec::new(),
        }
    }

    pub fn signal<S1, S2, S3>(path: S1, iface: S2, member: S3) -> Self
    where
        S1: Into<Cow<'static, str>>,
        S2: Into<Cow<'static, str>>,
        S3: Into<Cow<'static, str>>,
    {
        Self {
            kind: MessageKind::Signal,
            flags: MessageFlags::empty(),
            serial: 0,
            headers: Headers {
                path: Some(path.into()),
                interface: Some(iface.into()),
                member: Some(member.into()),
                ..Headers::default()
            },
            body: Vec::new(),
        }
    }

    /// An error reply addressed back at the sender of `to`.
    pub fn error_reply<S1, S2>(to: &Message, name: S1, text: S2) -> Self
    where
        S1: Into<Cow<'static, str>>,
        S2: Into<Cow<'static, str>>,
    {
        Self {
            kind: MessageKind::Error,
            flags: MessageFlags::empty(),
            serial: 0,
            headers: Headers {
                error_name: Some(name.into()),
                reply_serial: Some(to.serial),
                destination: to.headers.sender.clone().map(Cow::Owned),
                ..Headers::default()
            },
            body: vec![Arg::Simple(SimpleArg::String(text.into()))],
        }
    }

    /// Every field the message type requires must be present; the decoder
    /// rejects frames where one is missing.
    fn check_required(&self) -> Result<(), ProtocolError> {
        let h = &self.headers;
        let ok = match self.kind {
            MessageKind::MethodCall => h.path.is_some() && h.member.is_some(),
            MessageKind::Signal => h.path.is_some() && h.interface.is_some() && h.member.is_some(),
            MessageKind::MethodReturn => h.reply_serial.is_some(),
            MessageKind::Error => h.reply_serial.is_some() && h.error_name.is_some(),
        };
        if ok { Ok(()) } else { Err(ProtocolError::BadHeader("missing a required field")) }
    }

    /// Produces the full frame plus the fds its body referenced.
    pub fn serialize(mut self, endian: Endian) -> Result<(Vec<u8>, Vec<OwnedFd>), ProtocolError> {
        debug_assert_ne!(self.serial, 0);

        // the body starts 8-aligned within the frame, so encoding it from
        // offset zero keeps every inner alignment intact
        let mut body = Encoder::new(endian);
        let kinds: Vec<Kind> = self.body.iter().map(Arg::kind).collect();
        for arg in std::mem::take(&mut self.body) {
            body.put_arg(arg)?;
        }
        if self.headers.signature.is_none() && !kinds.is_empty() {
            self.headers.signature = Some(kinds);
        }
        self.headers.unix_fds = match body.fds.len() {
            0 => None,
            n => Some(n as u32),
        };
        self.check_required()?;

        let mut enc = Encoder::new(endian);
        enc.put_u8(endian.flag());
        enc.put_u8(self.kind as u8);
        enc.put_u8(self.flags.bits());
        enc.put_u8(PROTOCOL_VERSION);
        enc.put_u32(body.data.len() as u32);
        enc.put_u32(self.serial);
        enc.put_arg(self.headers.to_fields())?;
        enc.pad(8);
        enc.data.extend_from_slice(&body.data);

        if enc.data.len() > MAX_MESSAGE {
            return Err(ProtocolError::OversizedMessage(enc.data.len()));
        }
        Ok((enc.data, body.fds))
    }

    /// Parses one frame from the front of `data`. Returns `None` while the
    /// frame is still incomplete; a complete frame of an unknown message type
    /// yields `(consumed, None)` and is skipped by the caller.
    pub fn deserialize(
        data: &[u8],
        fds: &mut VecDeque<OwnedFd>,
    ) -> Result<Option<(usize, Option<Message>)>, ProtocolError> {
        if data.len() < 16 {
            return Ok(None);
        }

        let endian = Endian::from_flag(data[0]).ok_or(ProtocolError::Malformed("bad endianness flag"))?;
        if data[3] != PROTOCOL_VERSION {
            return Err(ProtocolError::Malformed("unsupported protocol version"));
        }
        let flags = MessageFlags::from_bits_truncate(data[2]);

        let mut dec = Decoder::at(data, 4, endian);
        let body_len = dec.get_u32()? as usize;
        let serial = dec.get_u32()?;
        let header_len = dec.get_u32()? as usize;

        let body_start = align_up(16 + header_len, 8);
        let total = body_start + body_len;
        if total > MAX_MESSAGE {
            return Err(ProtocolError::OversizedMessage(total));
        }
        if data.len() < total {
            return Ok(None);
        }
        if serial == 0 {
            return Err(ProtocolError::Malformed("zero serial"));
        }

        let mut dec = Decoder::at(&data[..total], 12, endian);
        let headers = Headers::from_fields(dec.get_arg(&field_array_kind())?)?;
        dec.pad(8)?;
        debug_assert_eq!(dec.offset, body_start);

        // this frame's descriptors, taken off the connection's fd queue
        let wanted = headers.unix_fds.unwrap_or(0) as usize;
        if fds.len() < wanted {
            return Err(ProtocolError::Malformed("missing file descriptors"));
        }
        dec.fds = fds.drain(..wanted).map(Some).collect();

        // unknown message types are skipped whole, their fds closed
        let Ok(kind) = MessageKind::try_from(data[1]) else {
            return Ok(Some((total, None)));
        };

        let mut body = Vec::new();
        if let Some(kinds) = &headers.signature {
            for kind in kinds {
                body.push(dec.get_arg(kind)?);
            }
        }
        if dec.offset != total {
            return Err(ProtocolError::Malformed("body does not match its signature"));
        }

        let msg = Message { kind, flags, serial, headers, body };
        msg.check_required()?;
        Ok(Some((total, Some(msg))))
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::ValidArg;

    fn parse(data: &[u8]) -> Message {
        let mut fds = VecDeque::new();
        let (consumed, msg) = Message::deserialize(data, &mut fds).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        msg.unwrap()
    }

    #[test]
    fn hello_fixture() {
        let mut msg = Message::method_call(
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "Hello",
        );
        msg.serial = 1;
        let (data, fds) = msg.serialize(Endian::Little).unwrap();

        assert!(fds.is_empty());
        assert_eq!(
            &data[..12],
            &[0x6c, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
        );
        // the header array is padded out to 8 and there is no body
        assert_eq!(data.len() % 8, 0);

        let back = parse(&data);
        assert_eq!(back.kind, MessageKind::MethodCall);
        assert_eq!(back.serial, 1);
        assert_eq!(back.headers.destination.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(back.headers.path.as_deref(), Some("/org/freedesktop/DBus"));
        assert_eq!(back.headers.interface.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(back.headers.member.as_deref(), Some("Hello"));
        assert_eq!(back.headers.signature, None);
        assert!(back.body.is_empty());
    }

    #[test]
    fn frame_round_trip_with_body() {
        let mut msg = Message::method_call("a.b", "/a", "a.b.C", "Frob");
        msg.serial = 7;
        msg.flags = MessageFlags::ALLOW_INTERACTIVE_AUTHORIZATION;
        msg.body = vec![("x".to_string(), 5u32).pack(), vec![1u8, 2, 3].pack()];

        let (data, _) = msg.serialize(Endian::Little).unwrap();
        let back = parse(&data);
        assert_eq!(back.flags, MessageFlags::ALLOW_INTERACTIVE_AUTHORIZATION);
        assert_eq!(signature_text(back.headers.signature.as_ref().unwrap()), "(su)ay");
        assert_eq!(back.body, vec![("x".to_string(), 5u32).pack(), vec![1u8, 2, 3].pack()]);
    }

    #[test]
    fn big_endian_frames_decode() {
        let mut msg = Message::signal("/a", "a.b.C", "Changed");
        msg.serial = 3;
        msg.body = vec![260u32.pack()];
        let (data, _) = msg.serialize(Endian::Big).unwrap();
        assert_eq!(data[0], b'B');

        let back = parse(&data);
        assert_eq!(back.kind, MessageKind::Signal);
        assert_eq!(back.body, vec![260u32.pack()]);
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut msg = Message::signal("/a", "a.b.C", "Changed");
        msg.serial = 1;
        msg.body = vec![1u64.pack()];
        let (data, _) = msg.serialize(Endian::Little).unwrap();

        let mut fds = VecDeque::new();
        for cut in [0, 3, 15, data.len() - 1] {
            assert!(Message::deserialize(&data[..cut], &mut fds).unwrap().is_none());
        }
        assert!(Message::deserialize(&data, &mut fds).unwrap().is_some());
    }

    #[test]
    fn required_fields_are_enforced() {
        // a method return without a reply serial is rejected
        let msg = Message {
            kind: MessageKind::MethodReturn,
            flags: MessageFlags::empty(),
            serial: 2,
            headers: Headers::default(),
            body: Vec::new(),
        };
        assert!(matches!(msg.serialize(Endian::Little), Err(ProtocolError::BadHeader(..))));

        // same on the wire: patch a signal into a method return
        let mut signal = Message::signal("/a", "a.b.C", "Changed");
        signal.serial = 2;
        let (mut data, _) = signal.serialize(Endian::Little).unwrap();
        data[1] = MessageKind::MethodReturn as u8;
        let mut fds = VecDeque::new();
        assert!(matches!(
            Message::deserialize(&data, &mut fds),
            Err(ProtocolError::BadHeader(..))
        ));
    }

    #[test]
    fn unknown_message_types_are_skipped() {
        let mut msg = Message::signal("/a", "a.b.C", "Changed");
        msg.serial = 2;
        let (mut data, _) = msg.serialize(Endian::Little).unwrap();
        data[1] = 9;

        let mut fds = VecDeque::new();
        let (consumed, parsed) = Message::deserialize(&data, &mut fds).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        assert!(parsed.is_none());
    }

    #[test]
    fn unknown_header_codes_are_ignored() {
        let fields = Arg::Compound(CompoundArg::Array(
            Kind::Struct(vec![Kind::Byte, Kind::Variant]),
            vec![
                field(FieldCode::Member, SimpleArg::String("Ping".into())),
                Arg::Compound(CompoundArg::Struct(vec![
                    Arg::Simple(SimpleArg::Byte(200)),
                    Arg::Compound(CompoundArg::Variant(Box::new(Arg::Simple(SimpleArg::U32(1))))),
                ])),
            ],
        ));
        let headers = Headers::from_fields(fields).unwrap();
        assert_eq!(headers.member.as_deref(), Some("Ping"));
    }

    #[test]
    fn body_must_match_signature() {
        let mut msg = Message::signal("/a", "a.b.C", "Changed");
        msg.serial = 2;
        msg.body = vec![1u32.pack()];
        let (mut data, _) = msg.serialize(Endian::Little).unwrap();
        // shrink the declared body length so the signature overruns it
        data[4..8].copy_from_slice(&1u32.to_le_bytes());

        let mut fds = VecDeque::new();
        assert!(Message::deserialize(&data, &mut fds).is_err());
    }
}
