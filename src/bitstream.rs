//! Little-endian cursor over a byte buffer, paired with an LSB-first bit mask
//! used by mask-driven variable-width fields.

use std::io::Cursor;

use byteorder::{LE, ReadBytesExt};

use crate::error::{Error, Result};

/// Consumes bits from a borrowed mask, least significant bit of each byte first.
#[derive(Debug, Clone, Default)]
pub struct BitMask<'a> {
    bytes: &'a [u8],
    consumed: usize,
}

impl<'a> BitMask<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        BitMask { bytes, consumed: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() * 8 - self.consumed
    }

    pub fn next_bit(&mut self) -> Result<bool> {
        let byte = self
            .bytes
            .get(self.consumed / 8)
            .ok_or(Error::BitMaskExhausted {
                consumed: self.consumed,
            })?;
        let bit = (byte >> (self.consumed % 8)) & 1;
        self.consumed += 1;
        Ok(bit != 0)
    }

    /// Two bits, the first one read being the low-order bit.
    pub fn next_pred2(&mut self) -> Result<u8> {
        let lo = self.next_bit()? as u8;
        let hi = self.next_bit()? as u8;
        Ok(lo | (hi << 1))
    }
}

pub struct BitstreamReader<'a> {
    cursor: Cursor<&'a [u8]>,
    mask: BitMask<'a>,
}

macro_rules! read_le {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                let offset = self.tell();
                let value = self.cursor.$name::<LE>();
                value.map_err(|_| self.rewind_truncated(offset, size_of::<$ty>()))
            }
        )*
    };
}

impl<'a> BitstreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitstreamReader {
            cursor: Cursor::new(data),
            mask: BitMask::default(),
        }
    }

    pub fn data(&self) -> &'a [u8] {
        *self.cursor.get_ref()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn tell(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.tell())
    }

    pub fn seek(&mut self, offset: usize) -> Result<()> {
        if offset > self.len() {
            return Err(self.truncated(offset, 0));
        }
        self.cursor.set_position(offset as u64);
        Ok(())
    }

    fn truncated(&self, offset: usize, wanted: usize) -> Error {
        Error::Truncated {
            offset,
            wanted,
            available: self.len().saturating_sub(offset),
        }
    }

    // a failed read leaves the cursor where it was
    fn rewind_truncated(&mut self, offset: usize, wanted: usize) -> Error {
        self.cursor.set_position(offset as u64);
        self.truncated(offset, wanted)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let offset = self.tell();
        let data = self.data();
        let end = offset
            .checked_add(n)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| self.truncated(offset, n))?;
        self.cursor.set_position(end as u64);
        Ok(&data[offset..end])
    }

    /// Everything from the cursor to the end of the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let offset = self.tell().min(self.len());
        let data = self.data();
        self.cursor.set_position(data.len() as u64);
        &data[offset..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let offset = self.tell();
        let value = self.cursor.read_u8();
        value.map_err(|_| self.rewind_truncated(offset, 1))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        let offset = self.tell();
        let value = self.cursor.read_i8();
        value.map_err(|_| self.rewind_truncated(offset, 1))
    }

    read_le! {
        read_u16 => u16,
        read_u32 => u32,
        read_u64 => u64,
        read_i16 => i16,
        read_i32 => i32,
        read_i64 => i64,
        read_f32 => f32,
    }

    pub fn read_ascii(&mut self, n: usize) -> Result<String> {
        let bytes = self.read_bytes(n)?;
        if !bytes.is_ascii() {
            return Err(Error::invalid(format!(
                "non-ascii bytes in {n}-byte string at offset {}",
                self.tell() - n
            )));
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    }

    pub fn bind_mask(&mut self, mask: &'a [u8]) {
        self.mask = BitMask::new(mask);
    }

    pub fn next_bit(&mut self) -> Result<bool> {
        self.mask.next_bit()
    }

    pub fn next_pred2(&mut self) -> Result<u8> {
        self.mask.next_pred2()
    }

    pub fn mask_remaining(&self) -> usize {
        self.mask.remaining()
    }
}
