//! Framing of bus messages: a fixed preamble, a header-field array and the
//! marshalled body. Only little-endian protocol version 1 is spoken, which is
//! what the cgroup manager emits.

use super::bus::BusError;
use super::serialize::{align_cursor, pad_to, BusSerialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::MethodCall => 1,
            Self::MethodReturn => 2,
            Self::Error => 3,
            Self::Signal => 4,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, BusError> {
        match byte {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(BusError::Deserialization(format!(
                "invalid message type {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Path,
    Interface,
    Member,
    ErrorName,
    ReplySerial,
    Destination,
    Sender,
    BodySignature,
    UnixFds,
}

impl FieldKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Path => 1,
            Self::Interface => 2,
            Self::Member => 3,
            Self::ErrorName => 4,
            Self::ReplySerial => 5,
            Self::Destination => 6,
            Self::Sender => 7,
            Self::BodySignature => 8,
            Self::UnixFds => 9,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, BusError> {
        match byte {
            1 => Ok(Self::Path),
            2 => Ok(Self::Interface),
            3 => Ok(Self::Member),
            4 => Ok(Self::ErrorName),
            5 => Ok(Self::ReplySerial),
            6 => Ok(Self::Destination),
            7 => Ok(Self::Sender),
            8 => Ok(Self::BodySignature),
            9 => Ok(Self::UnixFds),
            other => Err(BusError::Deserialization(format!(
                "invalid header field {other}"
            ))),
        }
    }

    /// The one-byte type signature each header field is declared with.
    fn type_byte(self) -> u8 {
        match self {
            Self::Path => b'o',
            Self::BodySignature => b'g',
            Self::ReplySerial | Self::UnixFds => b'u',
            _ => b's',
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    U32(u32),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::U32(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub kind: FieldKind,
    pub value: FieldValue,
}

impl HeaderField {
    pub fn path(value: &str) -> Self {
        Self {
            kind: FieldKind::Path,
            value: FieldValue::Str(value.into()),
        }
    }

    pub fn interface(value: &str) -> Self {
        Self {
            kind: FieldKind::Interface,
            value: FieldValue::Str(value.into()),
        }
    }

    pub fn member(value: &str) -> Self {
        Self {
            kind: FieldKind::Member,
            value: FieldValue::Str(value.into()),
        }
    }

    pub fn body_signature(value: &str) -> Self {
        Self {
            kind: FieldKind::BodySignature,
            value: FieldValue::Str(value.into()),
        }
    }

    pub fn unix_fds(count: u32) -> Self {
        Self {
            kind: FieldKind::UnixFds,
            value: FieldValue::U32(count),
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        // Every header field starts at an 8 byte boundary.
        pad_to(buf, 8);
        buf.extend_from_slice(&[self.kind.to_byte(), 1, self.kind.type_byte(), 0]);

        match (&self.value, self.kind) {
            (FieldValue::U32(v), _) => buf.extend_from_slice(&v.to_le_bytes()),
            (FieldValue::Str(s), FieldKind::BodySignature) => {
                // Signatures carry a one-byte length.
                buf.push(s.len() as u8);
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
            (FieldValue::Str(s), _) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
        }
    }

    fn read_from(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        let kind = FieldKind::from_byte(buf[*cursor])?;
        *cursor += 1;

        let signature_len = buf[*cursor] as usize;
        *cursor += 1;
        if signature_len != 1 {
            return Err(BusError::Unsupported(
                "container-typed header fields are not supported".into(),
            ));
        }

        let type_byte = buf[*cursor];
        *cursor += 2; // the type byte plus its null terminator
        if type_byte != kind.type_byte() {
            return Err(BusError::Deserialization(format!(
                "header field {kind:?} declared with unexpected type {type_byte:#x}"
            )));
        }

        let value = match type_byte {
            b'u' => {
                let raw = read_exact(buf, cursor, 4, "header u32")?;
                FieldValue::U32(u32::from_le_bytes(raw.try_into().unwrap()))
            }
            b'g' => {
                let len = buf[*cursor] as usize;
                *cursor += 1;
                let raw = read_exact(buf, cursor, len, "header signature")?;
                *cursor += 1;
                FieldValue::Str(string_from(raw)?)
            }
            _ => {
                let raw = read_exact(buf, cursor, 4, "header string length")?;
                let len = u32::from_le_bytes(raw.try_into().unwrap()) as usize;
                let raw = read_exact(buf, cursor, len, "header string")?;
                *cursor += 1;
                FieldValue::Str(string_from(raw)?)
            }
        };

        Ok(Self { kind, value })
    }
}

fn read_exact<'a>(
    buf: &'a [u8],
    cursor: &mut usize,
    len: usize,
    what: &str,
) -> Result<&'a [u8], BusError> {
    if buf.len() < *cursor + len {
        return Err(BusError::Deserialization(format!(
            "truncated message while reading {what}"
        )));
    }
    let slice = &buf[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn string_from(raw: &[u8]) -> Result<String, BusError> {
    String::from_utf8(raw.into())
        .map_err(|err| BusError::Deserialization(format!("header is not utf-8: {err}")))
}

/// One complete message as it travels over the socket.
#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub serial: u32,
    pub fields: Vec<HeaderField>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn method_call(serial: u32, fields: Vec<HeaderField>, body: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::MethodCall,
            serial,
            fields,
            body,
        }
    }

    pub fn field(&self, kind: FieldKind) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.kind == kind).map(|f| &f.value)
    }

    pub fn serialize(mut self) -> Vec<u8> {
        let mut out = vec![b'l', self.kind.to_byte(), 0, 1];
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());

        let mut fields = Vec::new();
        for field in &self.fields {
            field.write_to(&mut fields);
        }

        // The declared field-array length excludes the padding that brings
        // the body to its 8 byte boundary.
        out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        out.extend_from_slice(&fields);
        pad_to(&mut out, 8);
        out.append(&mut self.body);

        out
    }

    /// Parses one message from the start of `buf`, returning it along with
    /// the number of bytes consumed. Alignment inside a message is relative
    /// to its own first byte, so the caller must slice the stream per
    /// message.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), BusError> {
        let cursor = &mut 0;
        let preamble = read_exact(buf, cursor, 4, "preamble")?;
        if preamble[0] != b'l' {
            return Err(BusError::Unsupported(
                "big endian messages are not supported".into(),
            ));
        }
        let kind = MessageKind::from_byte(preamble[1])?;
        if preamble[3] != 1 {
            return Err(BusError::Unsupported(format!(
                "unknown protocol version {}",
                preamble[3]
            )));
        }

        let body_len = u32::from_le_bytes(
            read_exact(buf, cursor, 4, "body length")?.try_into().unwrap(),
        ) as usize;
        let serial =
            u32::from_le_bytes(read_exact(buf, cursor, 4, "serial")?.try_into().unwrap());
        let fields_len = u32::from_le_bytes(
            read_exact(buf, cursor, 4, "field array length")?
                .try_into()
                .unwrap(),
        ) as usize;

        let fields_buf = read_exact(buf, cursor, fields_len, "field array")?;
        let mut fields = Vec::new();
        let mut fields_cursor = 0;
        while fields_cursor < fields_buf.len() {
            fields.push(HeaderField::read_from(fields_buf, &mut fields_cursor)?);
            align_cursor(&mut fields_cursor, 8);
        }

        align_cursor(cursor, 8);
        let body = read_exact(buf, cursor, body_len, "body")?.to_vec();

        Ok((
            Self {
                kind,
                serial,
                fields,
                body,
            },
            *cursor,
        ))
    }

    /// The error text carried by an error message, when there is one.
    pub fn error_text(&self) -> Option<String> {
        if self.kind != MessageKind::Error {
            return None;
        }
        if self.body.is_empty() {
            return self
                .field(FieldKind::ErrorName)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        let mut cursor = 0;
        String::deserialize(&self.body, &mut cursor).ok()
    }
}
