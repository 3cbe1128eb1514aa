//! The wire marshaller: type-driven encoding and decoding of D-Bus values
//! with the protocol's alignment, endianness and length-prefix rules.

use std::{
    borrow::Cow,
    collections::HashMap,
    hash::Hash,
    os::fd::{AsRawFd, OwnedFd},
};

use crate::error::ProtocolError;

/// Arrays may carry at most 64 MiB of payload.
pub const MAX_ARRAY: usize = 1 << 26;

/// Byte order of an encoded message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") { Self::Big } else { Self::Little }
    }

    pub fn flag(self) -> u8 {
        match self {
            Self::Little => b'l',
            Self::Big => b'B',
        }
    }

    pub fn from_flag(raw: u8) -> Option<Self> {
        match raw {
            b'l' => Some(Self::Little),
            b'B' => Some(Self::Big),
            _ => None,
        }
    }
}

// #### signatures ####

/// One complete type from the signature grammar, parsed into a tree so the
/// marshaller never has to re-scan signature text at inner nesting levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Byte,      // y
    Bool,      // b
    I16,       // n
    U16,       // q
    I32,       // i
    U32,       // u
    I64,       // x
    U64,       // t
    Double,    // d
    String,    // s
    ObjPath,   // o
    Signature, // g
    UnixFd,    // h
    Variant,   // v
    Array(Box<Kind>),
    Struct(Vec<Kind>),
    Dict(Box<Kind>, Box<Kind>), // only as the element of an array
}

impl Kind {
    /// Natural alignment, in bytes, measured from the start of the message.
    pub fn align(&self) -> usize {
        match self {
            Kind::Byte | Kind::Signature | Kind::Variant => 1,
            Kind::I16 | Kind::U16 => 2,
            Kind::Bool | Kind::I32 | Kind::U32 | Kind::UnixFd => 4,
            Kind::String | Kind::ObjPath | Kind::Array(..) => 4,
            Kind::I64 | Kind::U64 | Kind::Double => 8,
            Kind::Struct(..) | Kind::Dict(..) => 8,
        }
    }

    /// Basic types are the ones a dict entry may use as its key.
    pub fn is_basic(&self) -> bool {
        !matches!(self, Kind::Variant | Kind::Array(..) | Kind::Struct(..) | Kind::Dict(..))
    }

    pub fn write(&self, out: &mut String) {
        let code = match self {
            Kind::Byte => 'y',
            Kind::Bool => 'b',
            Kind::I16 => 'n',
            Kind::U16 => 'q',
            Kind::I32 => 'i',
            Kind::U32 => 'u',
            Kind::I64 => 'x',
            Kind::U64 => 't',
            Kind::Double => 'd',
            Kind::String => 's',
            Kind::ObjPath => 'o',
            Kind::Signature => 'g',
            Kind::UnixFd => 'h',
            Kind::Variant => 'v',
            Kind::Array(el) => {
                out.push('a');
                el.write(out);
                return;
            }
            Kind::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write(out);
                }
                out.push(')');
                return;
            }
            Kind::Dict(key, val) => {
                out.push('{');
                key.write(out);
                val.write(out);
                out.push('}');
                return;
            }
        };
        out.push(code);
    }
}

/// Renders a sequence of complete types back into signature text.
pub fn signature_text(kinds: &[Kind]) -> String {
    let mut out = String::new();
    for kind in kinds {
        kind.write(&mut out);
    }
    out
}

/// Parses signature text into a sequence of complete types.
pub fn parse_signature(text: &str) -> Result<Vec<Kind>, ProtocolError> {
    if text.len() > 255 {
        return Err(ProtocolError::BadSignature(text.into()));
    }
    let mut rest = text.as_bytes();
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (kind, remaining) = parse_one(rest).map_err(|()| ProtocolError::BadSignature(text.into()))?;
        out.push(kind);
        rest = remaining;
    }
    Ok(out)
}

fn parse_one(s: &[u8]) -> Result<(Kind, &[u8]), ()> {
    let (&first, mut rest) = s.split_first().ok_or(())?;
    let kind = match first {
        b'y' => Kind::Byte,
        b'b' => Kind::Bool,
        b'n' => Kind::I16,
        b'q' => Kind::U16,
        b'i' => Kind::I32,
        b'u' => Kind::U32,
        b'x' => Kind::I64,
        b't' => Kind::U64,
        b'd' => Kind::Double,
        b's' => Kind::String,
        b'o' => Kind::ObjPath,
        b'g' => Kind::Signature,
        b'h' => Kind::UnixFd,
        b'v' => Kind::Variant,
        b'a' => {
            // dict entries exist only as the immediate element of an array
            if let Some((&b'{', inner)) = rest.split_first() {
                let (key, after_key) = parse_one(inner)?;
                if !key.is_basic() {
                    return Err(());
                }
                let (val, after_val) = parse_one(after_key)?;
                let (&close, remaining) = after_val.split_first().ok_or(())?;
                if close != b'}' {
                    return Err(());
                }
                rest = remaining;
                Kind::Array(Box::new(Kind::Dict(Box::new(key), Box::new(val))))
            } else {
                let (el, remaining) = parse_one(rest)?;
                rest = remaining;
                Kind::Array(Box::new(el))
            }
        }
        b'(' => {
            let mut fields = Vec::new();
            loop {
                let (&next, _) = rest.split_first().ok_or(())?;
                if next == b')' {
                    rest = &rest[1..];
                    break;
                }
                let (field, remaining) = parse_one(rest)?;
                fields.push(field);
                rest = remaining;
            }
            if fields.is_empty() {
                return Err(());
            }
            Kind::Struct(fields)
        }
        _ => return Err(()),
    };
    Ok((kind, rest))
}

/// The object path grammar: `/`, or `/`-separated non-empty segments of
/// `[A-Za-z0-9_]`.
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else { return false };
    rest.split('/').all(|segment| {
        !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

// #### values ####

/// A D-Bus value, realising the type grammar as a tagged union.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Simple(SimpleArg),
    Compound(CompoundArg),
}

#[derive(Clone, Debug)]
pub enum SimpleArg {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Double(f64),
    String(Cow<'static, str>),
    ObjPath(Cow<'static, str>),
    Signature(Vec<Kind>),
    Fd(WireFd),
}

impl PartialEq for SimpleArg {
    // doubles compare by bit pattern so value round-trips are well defined
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Byte(a), Self::Byte(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I16(a), Self::I16(b)) => a == b,
            (Self::U16(a), Self::U16(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::U32(a), Self::U32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::U64(a), Self::U64(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::ObjPath(a), Self::ObjPath(b)) => a == b,
            (Self::Signature(a), Self::Signature(b)) => a == b,
            (Self::Fd(a), Self::Fd(b)) => a == b,
            (..) => false,
        }
    }
}

/// An owned file descriptor travelling inside a value.
#[derive(Debug)]
pub struct WireFd {
    pub inner: OwnedFd,
}

impl From<OwnedFd> for WireFd {
    fn from(inner: OwnedFd) -> Self {
        Self { inner }
    }
}

impl Clone for WireFd {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.try_clone().expect("failed to duplicate fd while cloning a value"),
        }
    }
}

impl PartialEq for WireFd {
    fn eq(&self, other: &Self) -> bool {
        self.inner.as_raw_fd() == other.inner.as_raw_fd()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CompoundArg {
    /// element type plus items
    Array(Kind, Vec<Arg>),
    /// key type, value type, entries in wire order
    Dict(Kind, Kind, Vec<(SimpleArg, Arg)>),
    Struct(Vec<Arg>),
    Variant(Box<Arg>),
}

impl SimpleArg {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Byte(..) => Kind::Byte,
            Self::Bool(..) => Kind::Bool,
            Self::I16(..) => Kind::I16,
            Self::U16(..) => Kind::U16,
            Self::I32(..) => Kind::I32,
            Self::U32(..) => Kind::U32,
            Self::I64(..) => Kind::I64,
            Self::U64(..) => Kind::U64,
            Self::Double(..) => Kind::Double,
            Self::String(..) => Kind::String,
            Self::ObjPath(..) => Kind::ObjPath,
            Self::Signature(..) => Kind::Signature,
            Self::Fd(..) => Kind::UnixFd,
        }
    }
}

impl Arg {
    pub fn kind(&self) -> Kind {
        match self {
            Arg::Simple(simple) => simple.kind(),
            Arg::Compound(compound) => match compound {
                CompoundArg::Array(el, ..) => Kind::Array(Box::new(el.clone())),
                CompoundArg::Dict(key, val, ..) => {
                    Kind::Array(Box::new(Kind::Dict(Box::new(key.clone()), Box::new(val.clone()))))
                }
                CompoundArg::Struct(fields) => Kind::Struct(fields.iter().map(Arg::kind).collect()),
                CompoundArg::Variant(..) => Kind::Variant,
            },
        }
    }
}

// #### encoding ####

/// Grows a byte buffer value by value, zero-padding to each value's natural
/// alignment. File descriptors are moved into the out-of-band `fds` table and
/// encoded as their index.
pub struct Encoder {
    pub data: Vec<u8>,
    pub fds: Vec<OwnedFd>,
    endian: Endian,
}

impl Encoder {
    pub fn new(endian: Endian) -> Self {
        Self {
            data: Vec::with_capacity(256),
            fds: Vec::new(),
            endian,
        }
    }

    pub fn pad(&mut self, align: usize) {
        let needed = (align - self.data.len() % align) % align;
        self.data.resize(self.data.len() + needed, 0);
    }

    pub fn put_u8(&mut self, val: u8) {
        self.data.push(val);
    }

    pub fn put_u32(&mut self, val: u32) {
        self.pad(4);
        match self.endian {
            Endian::Little => self.data.extend_from_slice(&val.to_le_bytes()),
            Endian::Big => self.data.extend_from_slice(&val.to_be_bytes()),
        }
    }

    fn patch_u32(&mut self, at: usize, val: u32) {
        let bytes = match self.endian {
            Endian::Little => val.to_le_bytes(),
            Endian::Big => val.to_be_bytes(),
        };
        self.data[at..at + 4].copy_from_slice(&bytes);
    }

    fn put_str(&mut self, val: &str) {
        self.put_u32(val.len() as u32);
        self.data.extend_from_slice(val.as_bytes());
        self.data.push(0);
    }

    pub fn put_arg(&mut self, arg: Arg) -> Result<(), ProtocolError> {
        macro_rules! put_fixed {
            ($val:expr, $align:expr) => {{
                self.pad($align);
                match self.endian {
                    Endian::Little => self.data.extend_from_slice(&$val.to_le_bytes()),
                    Endian::Big => self.data.extend_from_slice(&$val.to_be_bytes()),
                }
            }};
        }

        match arg {
            Arg::Simple(simple) => match simple {
                SimpleArg::Byte(val) => self.data.push(val),
                SimpleArg::Bool(val) => self.put_u32(val as u32),
                SimpleArg::I16(val) => put_fixed!(val, 2),
                SimpleArg::U16(val) => put_fixed!(val, 2),
                SimpleArg::I32(val) => put_fixed!(val, 4),
                SimpleArg::U32(val) => put_fixed!(val, 4),
                SimpleArg::I64(val) => put_fixed!(val, 8),
                SimpleArg::U64(val) => put_fixed!(val, 8),
                SimpleArg::Double(val) => put_fixed!(val, 8),
                SimpleArg::String(val) => self.put_str(&val),
                SimpleArg::ObjPath(val) => {
                    if !is_valid_object_path(&val) {
                        return Err(ProtocolError::BadObjectPath(val.into_owned()));
                    }
                    self.put_str(&val);
                }
                SimpleArg::Signature(kinds) => {
                    let text = signature_text(&kinds);
                    if text.len() > 255 {
                        return Err(ProtocolError::BadSignature(text));
                    }
                    self.data.push(text.len() as u8);
                    self.data.extend_from_slice(text.as_bytes());
                    self.data.push(0);
                }
                SimpleArg::Fd(fd) => {
                    let idx = self.fds.len() as u32;
                    self.fds.push(fd.inner);
                    self.put_u32(idx);
                }
            },

            Arg::Compound(compound) => match compound {
                CompoundArg::Array(el, items) => {
                    self.put_u32(0); // patched below
                    let len_at = self.data.len() - 4;
                    // the padding before the first element is not counted
                    self.pad(el.align());
                    let start = self.data.len();
                    for item in items {
                        debug_assert_eq!(item.kind(), el);
                        self.put_arg(item)?;
                    }
                    let size = self.data.len() - start;
                    if size > MAX_ARRAY {
                        return Err(ProtocolError::OversizedArray(size));
                    }
                    self.patch_u32(len_at, size as u32);
                }

                CompoundArg::Dict(_key, _val, entries) => {
                    self.put_u32(0);
                    let len_at = self.data.len() - 4;
                    self.pad(8);
                    let start = self.data.len();
                    for (key, val) in entries {
                        self.pad(8);
                        self.put_arg(Arg::Simple(key))?;
                        self.put_arg(val)?;
                    }
                    let size = self.data.len() - start;
                    if size > MAX_ARRAY {
                        return Err(ProtocolError::OversizedArray(size));
                    }
                    self.patch_u32(len_at, size as u32);
                }

                CompoundArg::Struct(fields) => {
                    self.pad(8);
                    for field in fields {
                        self.put_arg(field)?;
                    }
                }

                CompoundArg::Variant(inner) => {
                    self.put_arg(Arg::Simple(SimpleArg::Signature(vec![inner.kind()])))?;
                    self.put_arg(*inner)?;
                }
            },
        }

        Ok(())
    }
}

// #### decoding ####

/// Walks a byte buffer guided by a type tree. The offset is measured from the
/// start of the message so alignment comes out right at any nesting level.
pub struct Decoder<'a> {
    data: &'a [u8],
    pub offset: usize,
    endian: Endian,
    /// out-of-band fd table; `h` values take their descriptor out by index
    pub fds: Vec<Option<OwnedFd>>,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self::at(data, 0, endian)
    }

    pub(crate) fn at(data: &'a [u8], offset: usize, endian: Endian) -> Self {
        Self {
            data,
            offset,
            endian,
            fds: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated);
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub fn pad(&mut self, align: usize) -> Result<(), ProtocolError> {
        let needed = (align - self.offset % align) % align;
        self.take(needed).map(drop)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.pad(4)?;
        let bytes = self.take(4)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    fn get_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len + 1)?;
        if raw[len] != 0 {
            return Err(ProtocolError::Malformed("string is not NUL-terminated"));
        }
        String::from_utf8(raw[..len].to_vec()).map_err(|_| ProtocolError::Utf8)
    }

    fn get_signature(&mut self) -> Result<Vec<Kind>, ProtocolError> {
        let len = self.get_u8()? as usize;
        let raw = self.take(len + 1)?;
        if raw[len] != 0 {
            return Err(ProtocolError::Malformed("signature is not NUL-terminated"));
        }
        let text = std::str::from_utf8(&raw[..len]).map_err(|_| ProtocolError::Utf8)?;
        parse_signature(text)
    }

    pub fn get_arg(&mut self, kind: &Kind) -> Result<Arg, ProtocolError> {
        macro_rules! get_fixed {
            ($typ:ident, $align:expr) => {{
                self.pad($align)?;
                let bytes = self.take(std::mem::size_of::<$typ>())?.try_into().unwrap();
                match self.endian {
                    Endian::Little => $typ::from_le_bytes(bytes),
                    Endian::Big => $typ::from_be_bytes(bytes),
                }
            }};
        }

        let arg = match kind {
            Kind::Byte => Arg::Simple(SimpleArg::Byte(self.get_u8()?)),

            Kind::Bool => {
                let raw = self.get_u32()?;
                match raw {
                    0 => Arg::Simple(SimpleArg::Bool(false)),
                    1 => Arg::Simple(SimpleArg::Bool(true)),
                    other => return Err(ProtocolError::BadBool(other)),
                }
            }

            Kind::I16 => Arg::Simple(SimpleArg::I16(get_fixed!(i16, 2))),
            Kind::U16 => Arg::Simple(SimpleArg::U16(get_fixed!(u16, 2))),
            Kind::I32 => Arg::Simple(SimpleArg::I32(get_fixed!(i32, 4))),
            Kind::U32 => Arg::Simple(SimpleArg::U32(self.get_u32()?)),
            Kind::I64 => Arg::Simple(SimpleArg::I64(get_fixed!(i64, 8))),
            Kind::U64 => Arg::Simple(SimpleArg::U64(get_fixed!(u64, 8))),
            Kind::Double => Arg::Simple(SimpleArg::Double(get_fixed!(f64, 8))),

            Kind::String => Arg::Simple(SimpleArg::String(Cow::Owned(self.get_str()?))),

            Kind::ObjPath => {
                let path = self.get_str()?;
                if !is_valid_object_path(&path) {
                    return Err(ProtocolError::BadObjectPath(path));
                }
                Arg::Simple(SimpleArg::ObjPath(Cow::Owned(path)))
            }

            Kind::Signature => Arg::Simple(SimpleArg::Signature(self.get_signature()?)),

            Kind::UnixFd => {
                let idx = self.get_u32()?;
                let slot = self.fds.get_mut(idx as usize).ok_or(ProtocolError::BadFdIndex(idx))?;
                let fd = slot.take().ok_or(ProtocolError::BadFdIndex(idx))?;
                Arg::Simple(SimpleArg::Fd(WireFd { inner: fd }))
            }

            Kind::Variant => {
                let kinds = self.get_signature()?;
                if kinds.len() != 1 {
                    return Err(ProtocolError::BadSignature(signature_text(&kinds)));
                }
                let inner = self.get_arg(&kinds[0])?;
                Arg::Compound(CompoundArg::Variant(Box::new(inner)))
            }

            Kind::Array(el) => {
                let len = self.get_u32()? as usize;
                if len > MAX_ARRAY {
                    return Err(ProtocolError::OversizedArray(len));
                }
                self.pad(el.align())?;
                let end = self.offset + len;
                if end > self.data.len() {
                    return Err(ProtocolError::Truncated);
                }

                if let Kind::Dict(key_kind, val_kind) = &**el {
                    let mut entries = Vec::new();
                    while self.offset < end {
                        self.pad(8)?;
                        let key = match self.get_arg(key_kind)? {
                            Arg::Simple(key) => key,
                            Arg::Compound(..) => unreachable!("dict keys are basic types"),
                        };
                        let val = self.get_arg(val_kind)?;
                        entries.push((key, val));
                    }
                    if self.offset != end {
                        return Err(ProtocolError::Malformed("array length does not match its contents"));
                    }
                    Arg::Compound(CompoundArg::Dict((**key_kind).clone(), (**val_kind).clone(), entries))
                } else {
                    let mut items = Vec::new();
                    while self.offset < end {
                        items.push(self.get_arg(el)?);
                    }
                    if self.offset != end {
                        return Err(ProtocolError::Malformed("array length does not match its contents"));
                    }
                    Arg::Compound(CompoundArg::Array((**el).clone(), items))
                }
            }

            Kind::Struct(fields) => {
                self.pad(8)?;
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.push(self.get_arg(field)?);
                }
                Arg::Compound(CompoundArg::Struct(out))
            }

            Kind::Dict(..) => {
                return Err(ProtocolError::Malformed("dict entry outside of an array"));
            }
        };

        Ok(arg)
    }
}

// #### packing rust types ####

/// Conversion between Rust values and [`Arg`]s, for building call bodies and
/// reading replies without spelling the value union out.
pub trait ValidArg {
    fn pack(self) -> Arg
    where
        Self: Sized;
    fn unpack(arg: Arg) -> Option<Self>
    where
        Self: Sized;
    fn kind() -> Kind;
}

macro_rules! impl_valid_arg {
    ($(($name:ident: $t:ident)),*,) => {
        $(
            impl ValidArg for $t {
                fn pack(self) -> Arg {
                    Arg::Simple(SimpleArg::$name(self))
                }
                fn unpack(arg: Arg) -> Option<Self> {
                    if let Arg::Simple(SimpleArg::$name(val)) = arg { Some(val) } else { None }
                }
                fn kind() -> Kind {
                    Kind::$name
                }
            }
        )*
    };
}

impl_valid_arg!(
    (Byte: u8),
    (Bool: bool),
    (I16: i16),
    (U16: u16),
    (I32: i32),
    (U32: u32),
    (I64: i64),
    (U64: u64),
    (Double: f64),
);

impl ValidArg for String {
    fn pack(self) -> Arg {
        Arg::Simple(SimpleArg::String(Cow::Owned(self)))
    }
    fn unpack(arg: Arg) -> Option<Self> {
        if let Arg::Simple(SimpleArg::String(val)) = arg { Some(val.into_owned()) } else { None }
    }
    fn kind() -> Kind {
        Kind::String
    }
}

impl ValidArg for &'static str {
    fn pack(self) -> Arg {
        Arg::Simple(SimpleArg::String(Cow::Borrowed(self)))
    }
    fn unpack(_arg: Arg) -> Option<Self> {
        None // borrowed strings cannot be read back out of a decoded value
    }
    fn kind() -> Kind {
        Kind::String
    }
}

/// A value of type `o`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectPath(pub Cow<'static, str>);

impl ObjectPath {
    pub fn new<S>(path: S) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self(path.into())
    }
}

impl ValidArg for ObjectPath {
    fn pack(self) -> Arg {
        Arg::Simple(SimpleArg::ObjPath(self.0))
    }
    fn unpack(arg: Arg) -> Option<Self> {
        if let Arg::Simple(SimpleArg::ObjPath(val)) = arg { Some(Self(val)) } else { None }
    }
    fn kind() -> Kind {
        Kind::ObjPath
    }
}

impl ValidArg for OwnedFd {
    fn pack(self) -> Arg {
        Arg::Simple(SimpleArg::Fd(WireFd { inner: self }))
    }
    fn unpack(arg: Arg) -> Option<Self> {
        if let Arg::Simple(SimpleArg::Fd(fd)) = arg { Some(fd.inner) } else { None }
    }
    fn kind() -> Kind {
        Kind::UnixFd
    }
}

/// A runtime-typed value of type `v`.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant(pub Arg);

impl Variant {
    pub fn new<T: ValidArg>(val: T) -> Self {
        Self(val.pack())
    }

    pub fn get<T: ValidArg>(self) -> Option<T> {
        T::unpack(self.0)
    }
}

impl ValidArg for Variant {
    fn pack(self) -> Arg {
        Arg::Compound(CompoundArg::Variant(Box::new(self.0)))
    }
    fn unpack(arg: Arg) -> Option<Self> {
        if let Arg::Compound(CompoundArg::Variant(inner)) = arg { Some(Self(*inner)) } else { None }
    }
    fn kind() -> Kind {
        Kind::Variant
    }
}

impl<T: ValidArg> ValidArg for Vec<T> {
    fn pack(self) -> Arg {
        let items = self.into_iter().map(T::pack).collect();
        Arg::Compound(CompoundArg::Array(T::kind(), items))
    }
    fn unpack(arg: Arg) -> Option<Self> {
        if let Arg::Compound(CompoundArg::Array(.., items)) = arg {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(T::unpack(item)?);
            }
            Some(out)
        } else {
            None
        }
    }
    fn kind() -> Kind {
        Kind::Array(Box::new(T::kind()))
    }
}

impl<K: ValidArg + Eq + Hash, V: ValidArg> ValidArg for HashMap<K, V> {
    fn pack(self) -> Arg {
        debug_assert!(K::kind().is_basic());
        let entries = self
            .into_iter()
            .map(|(key, val)| {
                let Arg::Simple(key) = key.pack() else { unreachable!("dict keys are basic types") };
                (key, val.pack())
            })
            .collect();
        Arg::Compound(CompoundArg::Dict(K::kind(), V::kind(), entries))
    }
    fn unpack(arg: Arg) -> Option<Self> {
        if let Arg::Compound(CompoundArg::Dict(.., entries)) = arg {
            let mut out = HashMap::with_capacity(entries.len());
            for (key, val) in entries {
                out.insert(K::unpack(Arg::Simple(key))?, V::unpack(val)?);
            }
            Some(out)
        } else {
            None
        }
    }
    fn kind() -> Kind {
        Kind::Array(Box::new(Kind::Dict(Box::new(K::kind()), Box::new(V::kind()))))
    }
}

/// tuples pack into a dbus `struct`
macro_rules! impl_valid_arg_tuple {
    ($([$(($num:tt, $big:ident, $small:ident)),*]),*,) => {
        $(
            impl<$($big: ValidArg,)*> ValidArg for ($($big,)*) {
                fn pack(self) -> Arg {
                    $(let $small = self.$num.pack();)*
                    Arg::Compound(CompoundArg::Struct(vec![$($small,)*]))
                }
                fn unpack(arg: Arg) -> Option<Self> {
                    if let Arg::Compound(CompoundArg::Struct(fields)) = arg {
                        let mut fields = fields.into_iter();
                        $(let $small = $big::unpack(fields.next()?)?;)*
                        Some(($($small,)*))
                    } else {
                        None
                    }
                }
                fn kind() -> Kind {
                    Kind::Struct(vec![$($big::kind(),)*])
                }
            }
        )*
    };
}

impl_valid_arg_tuple!(
    [(0, T0, t0)],
    [(0, T0, t0), (1, T1, t1)],
    [(0, T0, t0), (1, T1, t1), (2, T2, t2)],
    [(0, T0, t0), (1, T1, t1), (2, T2, t2), (3, T3, t3)],
);

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(args: Vec<Arg>) -> Vec<u8> {
        let mut enc = Encoder::new(Endian::Little);
        for arg in args {
            enc.put_arg(arg).unwrap();
        }
        enc.data
    }

    fn decode(data: &[u8], sig: &str) -> Result<Vec<Arg>, ProtocolError> {
        let mut dec = Decoder::new(data, Endian::Little);
        let mut out = Vec::new();
        for kind in parse_signature(sig)? {
            out.push(dec.get_arg(&kind)?);
        }
        Ok(out)
    }

    #[test]
    fn signature_parser() {
        for ok in ["", "y", "a{sv}", "(ii)", "v", "aa{s(vv)}", "aay", "a{yb}", "(yyyyuu)"] {
            assert!(parse_signature(ok).is_ok(), "{ok:?} should parse");
        }
        for bad in ["a", "{}", "{sss}", ")", "()", "a{vs}", "(i", "e", "a{s", "z"] {
            assert!(parse_signature(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn signature_text_round_trip() {
        for sig in ["a{sv}", "(ii)", "aa{s(vv)}", "yba{yat}x"] {
            assert_eq!(signature_text(&parse_signature(sig).unwrap()), sig);
        }
    }

    #[test]
    fn object_paths() {
        for ok in ["/", "/a", "/a/b_1", "/org/freedesktop/DBus"] {
            assert!(is_valid_object_path(ok), "{ok:?} should be valid");
        }
        for bad in ["", "//", "/a/", "/a-b", "a", "/a//b"] {
            assert!(!is_valid_object_path(bad), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn struct_alignment() {
        // in a (yt) struct the t lands at offset 8 from the struct start
        let data = encode(vec![(1u8, 2u64).pack()]);
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], 1);
        assert_eq!(&data[1..8], &[0; 7]);
        assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 2);
    }

    #[test]
    fn array_length_excludes_leading_padding() {
        let data = encode(vec![vec![1u64, 2u64].pack()]);
        // 4 length bytes, 4 padding bytes to the element alignment, 16 payload
        assert_eq!(data.len(), 24);
        assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), 16);
    }

    #[test]
    fn array_length_includes_inner_padding() {
        // each (yt) element pads itself to 8, and that padding is counted
        let data = encode(vec![vec![(1u8, 1u64), (2u8, 2u64)].pack()]);
        assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), 32);
    }

    #[test]
    fn booleans_are_canonical() {
        assert_eq!(decode(&[1, 0, 0, 0], "b").unwrap(), vec![true.pack()]);
        assert_eq!(decode(&[2, 0, 0, 0], "b"), Err(ProtocolError::BadBool(2)));
    }

    #[test]
    fn strings_must_be_utf8() {
        let data = encode(vec!["ab".pack()]);
        let mut broken = data.clone();
        broken[4] = 0xff;
        assert_eq!(decode(&broken, "s"), Err(ProtocolError::Utf8));
        assert_eq!(decode(&data, "s").unwrap(), vec!["ab".pack()]);
    }

    #[test]
    fn truncated_input() {
        assert_eq!(decode(&[1, 0], "u"), Err(ProtocolError::Truncated));
        assert_eq!(decode(&[8, 0, 0, 0, 0, 0], "au"), Err(ProtocolError::Truncated));
    }

    #[test]
    fn round_trip() {
        let mut dict = HashMap::new();
        dict.insert("mode".to_string(), Variant::new(7u32));
        dict.insert("label".to_string(), Variant::new("dark".to_string()));

        let args = vec![
            (-3i32, u64::MAX).pack(),
            dict.pack(),
            vec![vec![1u16, 2], vec![3]].pack(),
            Variant::new(Variant::new(0.5f64)).pack(),
            ObjectPath::new("/a/b_1").pack(),
        ];
        let sig = signature_text(&args.iter().map(Arg::kind).collect::<Vec<_>>());
        assert_eq!(sig, "(it)a{sv}aaqvo");

        let data = encode(args.clone());
        let back = decode(&data, &sig).unwrap();
        assert_eq!(back, args);
    }

    #[test]
    fn canonical_bytes_round_trip() {
        let args = vec![
            1u8.pack(),
            "hello".to_string().pack(),
            vec![(true, 2u64)].pack(),
            Variant::new(vec![1u32, 2]).pack(),
        ];
        let sig = signature_text(&args.iter().map(Arg::kind).collect::<Vec<_>>());

        let data = encode(args);
        let back = decode(&data, &sig).unwrap();
        assert_eq!(encode(back), data);
    }

    #[test]
    fn big_endian_decodes() {
        let mut enc = Encoder::new(Endian::Big);
        enc.put_arg((260u32, "hi".to_string()).pack()).unwrap();
        let mut dec = Decoder::new(&enc.data, Endian::Big);
        let back = dec.get_arg(&parse_signature("(us)").unwrap()[0]).unwrap();
        assert_eq!(back, (260u32, "hi".to_string()).pack());
    }

    #[test]
    fn fd_table() {
        // encoding moves the fd out of band and writes its index
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let mut enc = Encoder::new(Endian::Little);
        enc.put_arg(fd.pack()).unwrap();
        assert_eq!(enc.fds.len(), 1);
        assert_eq!(u32::from_le_bytes(enc.data[0..4].try_into().unwrap()), 0);

        // decoding takes it back out by index
        let mut dec = Decoder::new(&enc.data, Endian::Little);
        dec.fds = enc.fds.into_iter().map(Some).collect();
        let back = dec.get_arg(&Kind::UnixFd).unwrap();
        assert!(matches!(back, Arg::Simple(SimpleArg::Fd(..))));

        // a second read of the same index must fail
        let mut dec = Decoder::new(&[0, 0, 0, 0], Endian::Little);
        dec.fds = vec![None];
        assert_eq!(dec.get_arg(&Kind::UnixFd), Err(ProtocolError::BadFdIndex(0)));
    }

    #[test]
    fn variant_signature_must_be_single() {
        // a variant whose signature holds two complete types is rejected
        let data = [2, b'y', b'y', 0, 1, 2];
        let mut dec = Decoder::new(&data, Endian::Little);
        assert!(matches!(dec.get_arg(&Kind::Variant), Err(ProtocolError::BadSignature(..))));
    }

    #[test]
    fn oversized_array_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&(MAX_ARRAY as u32 + 1).to_le_bytes());
        let mut dec = Decoder::new(&data, Endian::Little);
        assert!(matches!(
            dec.get_arg(&Kind::Array(Box::new(Kind::Byte))),
            Err(ProtocolError::OversizedArray(..))
        ));
    }
}
