//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines the zero-copy (de)serialization traits [`ToBytes`] and
//! [`FromBytes`], as well as the helper structs [`ByteWriter`] and
//! [`ByteReader`], which wrap a `&mut [u8]` or `&[u8]` and offer useful
//! utilities to read and write values.
//!
//! All types that end up on the wire (requests and responses on the hub's
//! control channel, as well as the transport's advertisement values) want to
//! implement [`ToBytes`] and/or [`FromBytes`].

use crate::Error;
use core::{cmp, mem};

/// Wrapper around a byte slice that can be used to encode data into bytes.
///
/// All `write_*` methods on this type will return `Error::Eof` when the
/// underlying buffer slice is full.
pub struct ByteWriter<'a>(&'a mut [u8]);

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter(buf)
    }

    /// Consumes `self` and returns the part of the contained buffer that has
    /// not yet been written to.
    pub fn into_rest(self) -> &'a mut [u8] {
        self.0
    }

    /// Returns the number of bytes that can be written to `self` until it is
    /// full.
    pub fn space_left(&self) -> usize {
        self.0.len()
    }

    /// Skips the given number of bytes in the output data without writing
    /// anything there.
    ///
    /// The skipped bytes keep whatever contents the underlying buffer held,
    /// so this is only appropriate for reserved fields that were zeroed by
    /// the caller.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.space_left() < bytes {
            Err(Error::Eof)
        } else {
            let this = mem::take(&mut self.0);
            self.0 = &mut this[bytes..];
            Ok(())
        }
    }

    /// Writes all bytes from `other` to `self`.
    ///
    /// Returns `Error::Eof` when `self` does not have enough space left to
    /// fit `other`. In that case, `self` will not be modified.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            Err(Error::Eof)
        } else {
            self.0[..other.len()].copy_from_slice(other);
            let this = mem::take(&mut self.0);
            self.0 = &mut this[other.len()..];
            Ok(())
        }
    }

    /// Writes a single byte to `self`.
    ///
    /// Returns `Error::Eof` when no space is left.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.write_slice(&[byte])
    }

    /// Writes a `u16` to `self`, using Little Endian byte order.
    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes an `i16` to `self`, using Little Endian byte order.
    pub fn write_i16_le(&mut self, value: i16) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes a `u32` to `self`, using Little Endian byte order.
    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }
}

/// Allows reading values from a borrowed byte slice.
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Consumes `self` and returns the part of the contained buffer that has
    /// not yet been read from.
    pub fn into_rest(self) -> &'a [u8] {
        self.0
    }

    /// Returns the number of bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    /// Returns whether `self` is at the end of the underlying buffer (EOF).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Skips the given number of bytes in the input data without inspecting
    /// them.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.bytes_left() < bytes {
            Err(Error::Eof)
        } else {
            self.0 = &self.0[bytes..];
            Ok(())
        }
    }

    /// Reads a byte slice of length `len` from `self`.
    ///
    /// If `self` contains less than `len` bytes, `Error::Eof` will be
    /// returned and `self` will not be modified.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let slice = &self.0[..len];
            self.0 = &self.0[len..];
            Ok(slice)
        }
    }

    /// Reads a byte array `[u8; N]` from `self`.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buf = [0; N];
        buf.copy_from_slice(self.read_slice(N)?);
        Ok(buf)
    }

    /// Reads the remaining bytes from `self`.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    /// Reads a single byte from `self`.
    ///
    /// Returns `Error::Eof` when `self` is empty.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a `u16` from `self`, using Little Endian byte order.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Reads a `u32` from `self`, using Little Endian byte order.
    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Reads an `i32` from `self`, using Little Endian byte order.
    pub fn read_i32_le(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing
    /// `writer` to point past the encoded value.
    ///
    /// If `writer` does not contain enough space, an error will be returned
    /// and the state of the buffer is unspecified (eg. `self` may be
    /// partially written into `writer`).
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decode a `Self` from a byte slice, advancing `bytes` to point past the
    /// data that was read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an
    /// insufficient number of bytes, an error will be returned and the state
    /// of `bytes` is unspecified (it can point to arbitrary data).
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_eof_leaves_buffer_untouched() {
        let mut buf = [0xAA; 2];
        let mut writer = ByteWriter::new(&mut buf);
        assert_eq!(writer.write_slice(&[1, 2, 3]), Err(Error::Eof));
        assert_eq!(writer.space_left(), 2);
        writer.write_u16_le(0x1234).unwrap();
        assert_eq!(writer.write_u8(0), Err(Error::Eof));
        assert_eq!(buf, [0x34, 0x12]);
    }

    #[test]
    fn reader_roundtrip() {
        let mut buf = [0; 9];
        let mut writer = ByteWriter::new(&mut buf);
        writer.write_u8(0xF2).unwrap();
        writer.write_u16_le(0xBEEF).unwrap();
        writer.write_u32_le(0x01020304).unwrap();
        writer.write_i16_le(-2).unwrap();
        assert_eq!(writer.space_left(), 0);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_u8().unwrap(), 0xF2);
        assert_eq!(reader.read_u16_le().unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32_le().unwrap(), 0x01020304);
        assert_eq!(reader.read_i32_le(), Err(Error::Eof));
        assert_eq!(reader.read_slice(2).unwrap(), &[0xFE, 0xFF]);
        assert!(reader.is_empty());
    }
}
