//! Marshalling of the basic wire types the cgroup manager's bus protocol
//! uses. The daemon's whole API is expressed with strings, 32-bit integers,
//! integer arrays and passed file descriptors, so only those are implemented.

use super::bus::BusError;

/// Appends zero bytes until the buffer length is a multiple of `align`.
pub(crate) fn pad_to(buf: &mut Vec<u8>, align: usize) {
    if align <= 1 {
        return;
    }
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

/// Advances a read cursor to the next `align` boundary.
pub(crate) fn align_cursor(cursor: &mut usize, align: usize) {
    if align > 1 && *cursor % align != 0 {
        *cursor += align - (*cursor % align);
    }
}

fn take<'a>(buf: &'a [u8], cursor: &mut usize, len: usize, what: &str) -> Result<&'a [u8], BusError> {
    if buf.len() < *cursor + len {
        return Err(BusError::Deserialization(format!(
            "truncated message while reading {what}"
        )));
    }
    let slice = &buf[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

/// A value that can travel in a bus message body.
pub trait BusSerialize {
    /// The type's signature in the bus type notation.
    fn signature() -> String
    where
        Self: Sized;

    /// Appends the value to `buf`, padding to the type's alignment first but
    /// never after the last byte.
    fn serialize(&self, buf: &mut Vec<u8>);

    /// Reads the value from `buf` starting at `cursor`, aligning the cursor
    /// as the type requires.
    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError>
    where
        Self: Sized;
}

impl BusSerialize for () {
    fn signature() -> String {
        String::new()
    }

    fn serialize(&self, _: &mut Vec<u8>) {}

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        *cursor = buf.len();
        Ok(())
    }
}

impl BusSerialize for String {
    fn signature() -> String {
        "s".into()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        pad_to(buf, 4);
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.as_bytes());
        buf.push(0);
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        align_cursor(cursor, 4);
        let len = u32::from_le_bytes(take(buf, cursor, 4, "string length")?.try_into().unwrap());
        let bytes = take(buf, cursor, len as usize, "string")?;
        let value = String::from_utf8(bytes.into())
            .map_err(|err| BusError::Deserialization(format!("string is not utf-8: {err}")))?;
        *cursor += 1; // terminating null
        Ok(value)
    }
}

impl BusSerialize for i32 {
    fn signature() -> String {
        "i".into()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        pad_to(buf, 4);
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        align_cursor(cursor, 4);
        Ok(i32::from_le_bytes(
            take(buf, cursor, 4, "i32")?.try_into().unwrap(),
        ))
    }
}

impl BusSerialize for u32 {
    fn signature() -> String {
        "u".into()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        pad_to(buf, 4);
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        align_cursor(cursor, 4);
        Ok(u32::from_le_bytes(
            take(buf, cursor, 4, "u32")?.try_into().unwrap(),
        ))
    }
}

/// A file descriptor argument. On the wire it is an index into the message's
/// descriptor array; the descriptor itself travels as ancillary data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdIndex(pub u32);

impl BusSerialize for FdIndex {
    fn signature() -> String {
        "h".into()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.0.serialize(buf);
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        Ok(FdIndex(u32::deserialize(buf, cursor)?))
    }
}

/// Arrays carry their content length in bytes, then the elements.
impl BusSerialize for Vec<i32> {
    fn signature() -> String {
        "ai".into()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        pad_to(buf, 4);
        let len_slot = buf.len();
        buf.extend_from_slice(&[0; 4]);
        // i32 elements are 4-aligned, which the length field already is.
        let content_start = buf.len();
        for value in self {
            value.serialize(buf);
        }
        let content_len = (buf.len() - content_start) as u32;
        buf[len_slot..len_slot + 4].copy_from_slice(&content_len.to_le_bytes());
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        align_cursor(cursor, 4);
        let content_len =
            u32::from_le_bytes(take(buf, cursor, 4, "array length")?.try_into().unwrap()) as usize;
        let end = *cursor + content_len;
        if buf.len() < end {
            return Err(BusError::Deserialization(
                "truncated message while reading array".into(),
            ));
        }

        let mut values = Vec::new();
        while *cursor < end {
            values.push(i32::deserialize(buf, cursor)?);
        }
        Ok(values)
    }
}

impl<A: BusSerialize, B: BusSerialize> BusSerialize for (A, B) {
    fn signature() -> String {
        format!("{}{}", A::signature(), B::signature())
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.0.serialize(buf);
        self.1.serialize(buf);
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        Ok((A::deserialize(buf, cursor)?, B::deserialize(buf, cursor)?))
    }
}

impl<A: BusSerialize, B: BusSerialize, C: BusSerialize> BusSerialize for (A, B, C) {
    fn signature() -> String {
        format!("{}{}{}", A::signature(), B::signature(), C::signature())
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.0.serialize(buf);
        self.1.serialize(buf);
        self.2.serialize(buf);
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        Ok((
            A::deserialize(buf, cursor)?,
            B::deserialize(buf, cursor)?,
            C::deserialize(buf, cursor)?,
        ))
    }
}

impl<A: BusSerialize, B: BusSerialize, C: BusSerialize, D: BusSerialize> BusSerialize
    for (A, B, C, D)
{
    fn signature() -> String {
        format!(
            "{}{}{}{}",
            A::signature(),
            B::signature(),
            C::signature(),
            D::signature()
        )
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.0.serialize(buf);
        self.1.serialize(buf);
        self.2.serialize(buf);
        self.3.serialize(buf);
    }

    fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Self, BusError> {
        Ok((
            A::deserialize(buf, cursor)?,
            B::deserialize(buf, cursor)?,
            C::deserialize(buf, cursor)?,
            D::deserialize(buf, cursor)?,
        ))
    }
}
