//! Stream primitives consumed by generated decoders.
//!
//! Emitted code only ever calls through [`NifStream`]; [`ByteStream`] is the in-memory
//! implementation used by the decoder and by tests.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::block::ReadContext;
use crate::error::{DecodeError, NifResult};
use crate::packed::Packed;
use crate::version::known;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// A string field as stored in the stream.
///
/// Files from 20.1.0.1 on store strings as indices into the header's string table;
/// older files store them inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NifString {
    Inline(String),
    Index(u32),
}

impl Default for NifString {
    fn default() -> Self {
        NifString::Inline(String::new())
    }
}

impl NifString {
    pub const NONE_INDEX: u32 = u32::MAX;

    /// Resolves the string against a header string table.
    pub fn resolve<'a>(&'a self, table: &'a [String]) -> Option<&'a str> {
        match self {
            NifString::Inline(s) => Some(s.as_str()),
            NifString::Index(NifString::NONE_INDEX) => None,
            NifString::Index(i) => table.get(*i as usize).map(String::as_str),
        }
    }
}

/// Width of an inline length prefix preceding an array's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    U8,
    U16,
    U32,
}

/// The primitive reader interface.
pub trait NifStream {
    fn position(&self) -> u64;
    fn len(&self) -> u64;
    fn seek_to(&mut self, pos: u64) -> NifResult<()>;
    fn endian(&self) -> Endian;
    fn set_endian(&mut self, endian: Endian);

    fn read_u8(&mut self) -> NifResult<u8>;
    fn read_i8(&mut self) -> NifResult<i8>;
    fn read_u16(&mut self) -> NifResult<u16>;
    fn read_i16(&mut self) -> NifResult<i16>;
    fn read_u32(&mut self) -> NifResult<u32>;
    fn read_i32(&mut self) -> NifResult<i32>;
    fn read_u64(&mut self) -> NifResult<u64>;
    fn read_i64(&mut self) -> NifResult<i64>;
    fn read_f32(&mut self) -> NifResult<f32>;
    fn read_bytes(&mut self, n: usize) -> NifResult<Vec<u8>>;

    fn is_empty(&self) -> bool {
        self.position() >= self.len()
    }

    fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position())
    }

    /// Half precision float widened to `f32`.
    fn read_f16(&mut self) -> NifResult<f32> {
        Ok(f16_to_f32(self.read_u16()?))
    }

    /// Booleans are 32-bit before 4.1.0.1 and 8-bit from then on.
    fn read_bool(&mut self, version: u32) -> NifResult<bool> {
        if version >= known::V4_1_0_1.raw() {
            Ok(self.read_u8()? != 0)
        } else {
            Ok(self.read_u32()? != 0)
        }
    }

    fn read_char(&mut self) -> NifResult<char> {
        Ok(char::from(self.read_u8()?))
    }

    /// 32-bit length-prefixed string.
    fn read_sized_string(&mut self) -> NifResult<String> {
        let n = self.read_u32()?;
        let bytes = self.read_counted_bytes(u64::from(n), "sized string")?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 8-bit length-prefixed string; a trailing NUL is dropped.
    fn read_short_string(&mut self) -> NifResult<String> {
        let n = self.read_u8()?;
        let bytes = self.read_counted_bytes(u64::from(n), "short string")?;
        let text = match bytes.split_last() {
            Some((0, rest)) => rest,
            _ => bytes.as_slice(),
        };
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    /// Bytes up to (not including) the next `\n`.
    fn read_line_string(&mut self) -> NifResult<String> {
        let mut out = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == b'\n' {
                break;
            }
            out.push(b);
            if out.len() > 256 {
                return Err(DecodeError::Invalid {
                    offset: self.position(),
                    message: "line string longer than 256 bytes".to_string(),
                });
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Version dependent string: an index from 20.1.0.1 on, inline before.
    fn read_string(&mut self, ctx: &ReadContext) -> NifResult<NifString> {
        if ctx.version >= known::V20_1_0_1.raw() {
            Ok(NifString::Index(self.read_u32()?))
        } else {
            Ok(NifString::Inline(self.read_sized_string()?))
        }
    }

    fn read_packed(&mut self, size: usize) -> NifResult<Packed> {
        let bytes = self.read_counted_bytes(size as u64, "packed struct")?;
        Ok(Packed::new(bytes, self.endian()))
    }

    fn read_counted_bytes(&mut self, n: u64, what: &'static str) -> NifResult<Vec<u8>> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.position(),
                what,
            });
        }
        self.read_bytes(n as usize)
    }
}

/// Reads `len` elements with `read_one`.
///
/// The length comes from schema expressions, so it is checked here: negative lengths are
/// invalid and the initial allocation never exceeds what the stream could still hold.
pub fn read_array<T>(
    stream: &mut dyn NifStream,
    len: i64,
    mut read_one: impl FnMut(&mut dyn NifStream) -> NifResult<T>,
) -> NifResult<Vec<T>> {
    let n = usize::try_from(len).map_err(|_| DecodeError::Invalid {
        offset: stream.position(),
        message: format!("negative array length {len}"),
    })?;
    let cap = n.min(usize::try_from(stream.remaining()).unwrap_or(usize::MAX));
    let mut out = Vec::with_capacity(cap);
    for _ in 0..n {
        out.push(read_one(stream)?);
    }
    Ok(out)
}

/// Reads an inline length prefix of the given width, then that many elements.
pub fn read_prefixed_array<T>(
    stream: &mut dyn NifStream,
    prefix: LengthPrefix,
    read_one: impl FnMut(&mut dyn NifStream) -> NifResult<T>,
) -> NifResult<Vec<T>> {
    let len = match prefix {
        LengthPrefix::U8 => i64::from(stream.read_u8()?),
        LengthPrefix::U16 => i64::from(stream.read_u16()?),
        LengthPrefix::U32 => i64::from(stream.read_u32()?),
    };
    read_array(stream, len, read_one)
}

/// In-memory stream over a byte slice.
#[derive(Debug)]
pub struct ByteStream<'a> {
    cursor: Cursor<&'a [u8]>,
    endian: Endian,
}

impl<'a> ByteStream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteStream {
            cursor: Cursor::new(bytes),
            endian: Endian::Little,
        }
    }

    fn eof(&self, what: &'static str) -> impl Fn(std::io::Error) -> DecodeError {
        let offset = self.cursor.position();
        move |err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => DecodeError::Truncated { offset, what },
            _ => DecodeError::Io(err),
        }
    }
}

macro_rules! read_endian {
    ($self:ident, $method:ident, $what:literal) => {{
        let map = $self.eof($what);
        match $self.endian {
            Endian::Little => $self.cursor.$method::<LittleEndian>().map_err(map),
            Endian::Big => $self.cursor.$method::<BigEndian>().map_err(map),
        }
    }};
}

impl NifStream for ByteStream<'_> {
    fn position(&self) -> u64 {
        self.cursor.position()
    }

    fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn seek_to(&mut self, pos: u64) -> NifResult<()> {
        if pos > self.len() {
            return Err(DecodeError::Truncated {
                offset: pos,
                what: "seek target",
            });
        }
        self.cursor.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn endian(&self) -> Endian {
        self.endian
    }

    fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    fn read_u8(&mut self) -> NifResult<u8> {
        let map = self.eof("u8");
        self.cursor.read_u8().map_err(map)
    }

    fn read_i8(&mut self) -> NifResult<i8> {
        let map = self.eof("i8");
        self.cursor.read_i8().map_err(map)
    }

    fn read_u16(&mut self) -> NifResult<u16> {
        read_endian!(self, read_u16, "u16")
    }

    fn read_i16(&mut self) -> NifResult<i16> {
        read_endian!(self, read_i16, "i16")
    }

    fn read_u32(&mut self) -> NifResult<u32> {
        read_endian!(self, read_u32, "u32")
    }

    fn read_i32(&mut self) -> NifResult<i32> {
        read_endian!(self, read_i32, "i32")
    }

    fn read_u64(&mut self) -> NifResult<u64> {
        read_endian!(self, read_u64, "u64")
    }

    fn read_i64(&mut self) -> NifResult<i64> {
        read_endian!(self, read_i64, "i64")
    }

    fn read_f32(&mut self) -> NifResult<f32> {
        read_endian!(self, read_f32, "f32")
    }

    fn read_bytes(&mut self, n: usize) -> NifResult<Vec<u8>> {
        let map = self.eof("bytes");
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf).map_err(map)?;
        Ok(buf)
    }
}

pub(crate) fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let mant = u32::from(bits & 0x3ff);
    let out = match (exp, mant) {
        (0, 0) => sign,
        (0, _) => {
            // subnormal: renormalize into an f32 exponent
            let mut e: i32 = -14;
            let mut m = mant;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (((e + 127) as u32) << 23) | ((m & 0x3ff) << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7fc0_0000 | (mant << 13),
        _ => sign | ((exp + 112) << 23) | (mant << 13),
    };
    f32::from_bits(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_and_big_endian() {
        let bytes = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_u32().unwrap(), 1);
        s.set_endian(Endian::Big);
        assert_eq!(s.read_u32().unwrap(), 2);
        assert!(s.is_empty());
    }

    #[test]
    fn eof_is_reported_as_truncated() {
        let mut s = ByteStream::new(&[0x01, 0x02]);
        match s.read_u32() {
            Err(DecodeError::Truncated { what, .. }) => assert_eq!(what, "u32"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bool_width_depends_on_version() {
        let bytes = [1u8, 1, 0, 0, 0];
        let mut s = ByteStream::new(&bytes);
        assert!(s.read_bool(known::V4_1_0_1.raw()).unwrap());
        assert_eq!(s.position(), 1);
        assert!(s.read_bool(known::V3_3_0_13.raw()).unwrap());
        assert_eq!(s.position(), 5);
    }

    #[test]
    fn short_string_drops_trailing_nul() {
        let bytes = [4u8, b'a', b'b', b'c', 0];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_short_string().unwrap(), "abc");
    }

    #[test]
    fn sized_string_longer_than_stream_is_truncated() {
        let bytes = [0xff, 0xff, 0xff, 0x7f, b'a'];
        let mut s = ByteStream::new(&bytes);
        assert!(matches!(
            s.read_sized_string(),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn prefixed_array_consumes_its_prefix() {
        let bytes = [2u8, 0, 7, 0, 9, 0];
        let mut s = ByteStream::new(&bytes);
        let xs = read_prefixed_array(&mut s, LengthPrefix::U16, |s| s.read_u16()).unwrap();
        assert_eq!(xs, vec![7, 9]);
        assert!(s.is_empty());
    }

    #[test]
    fn negative_array_length_is_invalid() {
        let mut s = ByteStream::new(&[]);
        assert!(matches!(
            read_array(&mut s, -1, |s| s.read_u8()),
            Err(DecodeError::Invalid { .. })
        ));
    }

    #[test]
    fn huge_array_length_fails_without_allocating_it() {
        let mut s = ByteStream::new(&[0u8; 4]);
        assert!(matches!(
            read_array(&mut s, i64::from(u32::MAX), |s| s.read_u32()),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn half_floats_widen() {
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert!(f16_to_f32(0x7c00).is_infinite());
        assert_eq!(f16_to_f32(0x0001), 2f32.powi(-24));
    }

    #[test]
    fn nif_string_resolution() {
        let table = vec!["Scene Root".to_string()];
        assert_eq!(NifString::Index(0).resolve(&table), Some("Scene Root"));
        assert_eq!(NifString::Index(NifString::NONE_INDEX).resolve(&table), None);
        assert_eq!(NifString::Index(5).resolve(&table), None);
        assert_eq!(
            NifString::Inline("x".to_string()).resolve(&table),
            Some("x")
        );
    }
}
