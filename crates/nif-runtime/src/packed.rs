use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::stream::{f16_to_f32, Endian};

/// A fixed-layout record read from the stream in one batch.
///
/// Generated code reads the whole record with [`crate::NifStream::read_packed`] and then
/// picks fields out at compile-time offsets. Offsets past the end yield zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed {
    bytes: Vec<u8>,
    endian: Endian,
}

impl Packed {
    pub fn new(bytes: Vec<u8>, endian: Endian) -> Self {
        Packed { bytes, endian }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn window<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.bytes.get(offset..offset.saturating_add(N)) {
            out.copy_from_slice(src);
        }
        out
    }

    pub fn u8_at(&self, offset: usize) -> u8 {
        self.window::<1>(offset)[0]
    }

    pub fn i8_at(&self, offset: usize) -> i8 {
        self.u8_at(offset) as i8
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        let w = self.window::<2>(offset);
        match self.endian {
            Endian::Little => LittleEndian::read_u16(&w),
            Endian::Big => BigEndian::read_u16(&w),
        }
    }

    pub fn i16_at(&self, offset: usize) -> i16 {
        self.u16_at(offset) as i16
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        let w = self.window::<4>(offset);
        match self.endian {
            Endian::Little => LittleEndian::read_u32(&w),
            Endian::Big => BigEndian::read_u32(&w),
        }
    }

    pub fn i32_at(&self, offset: usize) -> i32 {
        self.u32_at(offset) as i32
    }

    pub fn u64_at(&self, offset: usize) -> u64 {
        let w = self.window::<8>(offset);
        match self.endian {
            Endian::Little => LittleEndian::read_u64(&w),
            Endian::Big => BigEndian::read_u64(&w),
        }
    }

    pub fn i64_at(&self, offset: usize) -> i64 {
        self.u64_at(offset) as i64
    }

    pub fn f32_at(&self, offset: usize) -> f32 {
        f32::from_bits(self.u32_at(offset))
    }

    pub fn f16_at(&self, offset: usize) -> f32 {
        f16_to_f32(self.u16_at(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fields_at_offsets() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.push(0xff);
        let p = Packed::new(bytes, Endian::Little);
        assert_eq!(p.f32_at(0), 1.5);
        assert_eq!(p.u16_at(4), 7);
        assert_eq!(p.i8_at(6), -1);
        assert_eq!(p.len(), 7);
    }

    #[test]
    fn honours_big_endian() {
        let p = Packed::new(vec![0, 0, 1, 0], Endian::Big);
        assert_eq!(p.u32_at(0), 256);
    }

    #[test]
    fn out_of_range_reads_zero() {
        let p = Packed::new(vec![1, 2], Endian::Little);
        assert_eq!(p.u32_at(0), 0);
        assert_eq!(p.u8_at(9), 0);
    }
}
