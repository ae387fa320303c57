//! Primitive encoders and decoders for the master protocol.
//!
//! [`StreamOutput`] and [`StreamInput`] wrap a borrowed byte stream together with the
//! negotiated [`ProtocolVersion`]. Every multi-field structure is written in a fixed field
//! order; a field introduced in version *V* is only written or read when
//! [`StreamOutput::since`] / [`StreamInput::since`] reports that the peer speaks *V*.
//!
//! # Binary Format
//!
//! - Fixed-width integers and floats are big-endian.
//! - Booleans are a single `0`/`1` byte.
//! - Compressed integers are zigzag-mapped LEB128, one to five bytes.
//! - Strings are a compressed byte length followed by UTF-8 bytes. Bounded strings are
//!   limited to [`MAX_UTF_LENGTH`] bytes.
//! - Nullable values are a boolean presence flag followed by the value when present.
use std::io::{Read, Write};

use crate::{ClientError, error::from_io};

use super::ProtocolVersion;

/// Largest byte length accepted for a bounded string.
pub const MAX_UTF_LENGTH: usize = 65535;

const MAX_COMPRESSED_INT_BYTES: usize = 5;

/// Value that can be written as a command parameter.
pub trait Streamable {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError>;
}

/// Value that can be read back as a typed query result.
pub trait Readable: Sized {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError>;
}

/// Writes primitives onto a borrowed stream.
pub struct StreamOutput<'a> {
    inner: &'a mut dyn Write,
    version: ProtocolVersion,
}

impl<'a> StreamOutput<'a> {
    pub fn new(inner: &'a mut dyn Write, version: ProtocolVersion) -> Self {
        Self { inner, version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether a field introduced in `introduced` must be written.
    pub fn since(&self, introduced: ProtocolVersion) -> bool {
        self.version >= introduced
    }

    pub(crate) fn writer(&mut self) -> &mut dyn Write {
        &mut *self.inner
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.inner.write_all(bytes).map_err(from_io)
    }

    pub fn write_byte(&mut self, value: u8) -> Result<(), ClientError> {
        self.put(&[value])
    }

    pub fn write_boolean(&mut self, value: bool) -> Result<(), ClientError> {
        self.write_byte(value as u8)
    }

    pub fn write_short(&mut self, value: i16) -> Result<(), ClientError> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_int(&mut self, value: i32) -> Result<(), ClientError> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_long(&mut self, value: i64) -> Result<(), ClientError> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_float(&mut self, value: f32) -> Result<(), ClientError> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_double(&mut self, value: f64) -> Result<(), ClientError> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_compressed_int(&mut self, value: i32) -> Result<(), ClientError> {
        let mut zigzag = ((value << 1) ^ (value >> 31)) as u32;
        let mut buf = [0u8; MAX_COMPRESSED_INT_BYTES];
        let mut len = 0;
        loop {
            let byte = (zigzag & 0x7f) as u8;
            zigzag >>= 7;
            if zigzag == 0 {
                buf[len] = byte;
                len += 1;
                break;
            }
            buf[len] = byte | 0x80;
            len += 1;
        }
        self.put(&buf[..len])
    }

    /// Bounded UTF-8 string, at most [`MAX_UTF_LENGTH`] encoded bytes.
    pub fn write_utf(&mut self, value: &str) -> Result<(), ClientError> {
        if value.len() > MAX_UTF_LENGTH {
            return Err(ClientError::protocol(format!(
                "string of {} bytes exceeds bounded length {MAX_UTF_LENGTH}",
                value.len()
            )));
        }
        self.write_compressed_int(value.len() as i32)?;
        self.put(value.as_bytes())
    }

    pub fn write_long_utf(&mut self, value: &str) -> Result<(), ClientError> {
        let len = i32::try_from(value.len())
            .map_err(|_| ClientError::protocol("string too long for the wire"))?;
        self.write_compressed_int(len)?;
        self.put(value.as_bytes())
    }

    pub fn write_nullable_utf(&mut self, value: Option<&str>) -> Result<(), ClientError> {
        self.write_boolean(value.is_some())?;
        match value {
            Some(s) => self.write_utf(s),
            None => Ok(()),
        }
    }

    pub fn write_nullable<T: Streamable + ?Sized>(
        &mut self,
        value: Option<&T>,
    ) -> Result<(), ClientError> {
        self.write_boolean(value.is_some())?;
        match value {
            Some(v) => v.write_to(self),
            None => Ok(()),
        }
    }

    pub fn write_params(&mut self, params: &[&dyn Streamable]) -> Result<(), ClientError> {
        for param in params {
            param.write_to(self)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ClientError> {
        self.inner.flush().map_err(from_io)
    }
}

/// Reads primitives from a borrowed stream.
pub struct StreamInput<'a> {
    inner: &'a mut dyn Read,
    version: ProtocolVersion,
    last_status: Option<u8>,
}

impl<'a> StreamInput<'a> {
    pub fn new(inner: &'a mut dyn Read, version: ProtocolVersion) -> Self {
        Self {
            inner,
            version,
            last_status: None,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether a field introduced in `introduced` is present on the stream.
    pub fn since(&self, introduced: ProtocolVersion) -> bool {
        self.version >= introduced
    }

    /// Most recent status byte read through [`StreamInput::read_status`].
    pub fn last_status(&self) -> Option<u8> {
        self.last_status
    }

    pub(crate) fn reader(&mut self) -> &mut dyn Read {
        &mut *self.inner
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ClientError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(from_io)?;
        Ok(buf)
    }

    pub fn read_byte(&mut self) -> Result<u8, ClientError> {
        Ok(self.take::<1>()?[0])
    }

    /// Reads a leading status byte and remembers it for error context.
    pub fn read_status(&mut self) -> Result<u8, ClientError> {
        let code = self.read_byte()?;
        self.last_status = Some(code);
        Ok(code)
    }

    pub fn read_boolean(&mut self) -> Result<bool, ClientError> {
        match self.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(ClientError::protocol(format!("invalid boolean byte {b:#04x}"))),
        }
    }

    pub fn read_short(&mut self) -> Result<i16, ClientError> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    pub fn read_int(&mut self) -> Result<i32, ClientError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn read_long(&mut self) -> Result<i64, ClientError> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    pub fn read_float(&mut self) -> Result<f32, ClientError> {
        Ok(f32::from_be_bytes(self.take()?))
    }

    pub fn read_double(&mut self) -> Result<f64, ClientError> {
        Ok(f64::from_be_bytes(self.take()?))
    }

    pub fn read_compressed_int(&mut self) -> Result<i32, ClientError> {
        let mut zigzag: u32 = 0;
        for i in 0..MAX_COMPRESSED_INT_BYTES {
            let byte = self.read_byte()?;
            let bits = (byte & 0x7f) as u32;
            if i == MAX_COMPRESSED_INT_BYTES - 1 && bits > 0x0f {
                return Err(ClientError::protocol("compressed int overflows 32 bits"));
            }
            zigzag |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32));
            }
        }
        Err(ClientError::protocol("compressed int longer than 5 bytes"))
    }

    fn read_length(&mut self, max: usize) -> Result<usize, ClientError> {
        let len = self.read_compressed_int()?;
        if len < 0 {
            return Err(ClientError::protocol(format!("negative length {len}")));
        }
        let len = len as usize;
        if len > max {
            return Err(ClientError::protocol(format!(
                "length {len} exceeds maximum {max}"
            )));
        }
        Ok(len)
    }

    fn read_string_bytes(&mut self, len: usize) -> Result<String, ClientError> {
        let mut bytes = Vec::with_capacity(len.min(MAX_UTF_LENGTH));
        let read = (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut bytes)
            .map_err(from_io)?;
        if read != len {
            return Err(ClientError::protocol(format!(
                "truncated string: expected {len} bytes, got {read}"
            )));
        }
        String::from_utf8(bytes).map_err(|e| ClientError::protocol(format!("invalid UTF-8: {e}")))
    }

    pub fn read_utf(&mut self) -> Result<String, ClientError> {
        let len = self.read_length(MAX_UTF_LENGTH)?;
        self.read_string_bytes(len)
    }

    pub fn read_long_utf(&mut self) -> Result<String, ClientError> {
        let len = self.read_length(i32::MAX as usize)?;
        self.read_string_bytes(len)
    }

    pub fn read_nullable_utf(&mut self) -> Result<Option<String>, ClientError> {
        if self.read_boolean()? {
            Ok(Some(self.read_utf()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_nullable<T: Readable>(&mut self) -> Result<Option<T>, ClientError> {
        if self.read_boolean()? {
            Ok(Some(T::read_from(self)?))
        } else {
            Ok(None)
        }
    }
}

/// Integer written with the compressed variable-length encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressed(pub i32);

impl Streamable for Compressed {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_compressed_int(self.0)
    }
}

impl Readable for Compressed {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        Ok(Compressed(input.read_compressed_int()?))
    }
}

macro_rules! primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Streamable for $ty {
            fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
                out.$write(*self)
            }
        }

        impl Readable for $ty {
            fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
                input.$read()
            }
        }
    };
}

primitive!(bool, write_boolean, read_boolean);
primitive!(i16, write_short, read_short);
primitive!(i32, write_int, read_int);
primitive!(i64, write_long, read_long);
primitive!(f32, write_float, read_float);
primitive!(f64, write_double, read_double);

/// Empty result of a fire-and-confirm update.
impl Readable for () {
    fn read_from(_input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        Ok(())
    }
}

impl Streamable for str {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_utf(self)
    }
}

impl Streamable for &str {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_utf(self)
    }
}

impl Streamable for String {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_utf(self)
    }
}

impl Readable for String {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        input.read_utf()
    }
}

impl<T: Streamable> Streamable for Option<T> {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_nullable(self.as_ref())
    }
}

impl<T: Readable> Readable for Option<T> {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        input.read_nullable()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn encode(f: impl FnOnce(&mut StreamOutput<'_>) -> Result<(), ClientError>) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut out = StreamOutput::new(&mut buf, ProtocolVersion::CURRENT);
        f(&mut out).unwrap();
        buf
    }

    #[test]
    fn compressed_int_round_trip() {
        for value in [0, 1, -1, 63, -64, 64, 8191, -8192, 1 << 20, i32::MAX, i32::MIN] {
            let bytes = encode(|out| out.write_compressed_int(value));
            let mut cursor = Cursor::new(bytes);
            let mut input = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT);
            assert_eq!(input.read_compressed_int().unwrap(), value);
        }
    }

    #[test]
    fn sentinel_is_single_byte() {
        assert_eq!(encode(|out| out.write_compressed_int(-1)), vec![1]);
        assert_eq!(encode(|out| out.write_compressed_int(5)).len(), 1);
        assert_eq!(encode(|out| out.write_compressed_int(i32::MIN)).len(), 5);
    }

    #[test]
    fn compressed_param_uses_variable_width() {
        let params: [&dyn Streamable; 2] = [&Compressed(-1), &300i32];
        let bytes = encode(|out| out.write_params(&params));
        assert_eq!(bytes.len(), 1 + 4);

        let mut cursor = Cursor::new(bytes);
        let mut input = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT);
        assert_eq!(Compressed::read_from(&mut input).unwrap(), Compressed(-1));
        assert_eq!(i32::read_from(&mut input).unwrap(), 300);
    }

    #[test]
    fn mixed_fields_in_order() {
        let bytes = encode(|out| {
            out.write_utf("héllo")?;
            out.write_long(-42)?;
            out.write_nullable_utf(None)?;
            out.write_nullable(Some(&7i16))?;
            out.write_double(2.5)?;
            out.write_long_utf("long")
        });
        let mut cursor = Cursor::new(bytes);
        let mut input = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT);
        assert_eq!(input.read_utf().unwrap(), "héllo");
        assert_eq!(input.read_long().unwrap(), -42);
        assert_eq!(input.read_nullable_utf().unwrap(), None);
        assert_eq!(input.read_nullable::<i16>().unwrap(), Some(7));
        assert_eq!(input.read_double().unwrap(), 2.5);
        assert_eq!(input.read_long_utf().unwrap(), "long");
    }

    #[test]
    #[should_panic(expected = "negative length")]
    fn negative_length_rejected() {
        let bytes = encode(|out| out.write_compressed_int(-3));
        let mut cursor = Cursor::new(bytes);
        StreamInput::new(&mut cursor, ProtocolVersion::CURRENT)
            .read_utf()
            .unwrap();
    }

    #[test]
    fn truncated_string_rejected() {
        let mut bytes = encode(|out| out.write_utf("truncate me"));
        bytes.truncate(4);
        let mut cursor = Cursor::new(bytes);
        let err = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT)
            .read_utf()
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn truncated_fixed_width_rejected() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT)
            .read_int()
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn invalid_boolean_rejected() {
        let mut cursor = Cursor::new(vec![7u8]);
        let err = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT)
            .read_boolean()
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn bounded_string_limit_enforced_on_write() {
        let big = "x".repeat(MAX_UTF_LENGTH + 1);
        let mut buf = Vec::new();
        let mut out = StreamOutput::new(&mut buf, ProtocolVersion::CURRENT);
        assert!(out.write_utf(&big).is_err());
        assert!(out.write_long_utf(&big).is_ok());
    }

    #[test]
    fn version_gate() {
        let mut buf = Vec::new();
        let out = StreamOutput::new(&mut buf, ProtocolVersion::V1_0_0);
        assert!(out.since(ProtocolVersion::V1_0_0));
        assert!(!out.since(ProtocolVersion::V1_1_0));
    }
}
