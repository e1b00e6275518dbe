//! XDR (RFC 4506) encoding for the daemon's RPC messages.
//!
//! Everything is big-endian and padded to 4-byte boundaries.

use crate::core::{Result, StoreError};

const MAX_STRING: usize = 4 * 1024 * 1024;
const MAX_ARRAY: u32 = 1 << 20;

#[derive(Debug, Default)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u32(value as u32)
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.pad(value.len());
        self
    }

    /// Optional string: a presence flag followed by the string.
    pub fn put_opt_string(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(s) => {
                self.put_bool(true);
                self.put_string(s)
            }
            None => self.put_bool(false),
        }
    }

    pub fn put_fixed_opaque(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self.pad(bytes.len());
        self
    }

    fn pad(&mut self, len: usize) {
        let padding = (4 - len % 4) % 4;
        self.buf.extend(std::iter::repeat_n(0u8, padding));
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                StoreError::Protocol(format!(
                    "truncated XDR data: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip_padding(&mut self, len: usize) -> Result<()> {
        let padding = (4 - len % 4) % 4;
        self.take(padding).map(|_| ())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StoreError::Protocol(format!("invalid XDR bool {}", other))),
        }
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        if len > MAX_STRING {
            return Err(StoreError::Protocol(format!("XDR string of {} bytes", len)));
        }
        let bytes = self.take(len)?;
        let value = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::Protocol(format!("XDR string is not UTF-8: {}", e)))?
            .to_string();
        self.skip_padding(len)?;
        Ok(value)
    }

    pub fn get_opt_string(&mut self) -> Result<Option<String>> {
        if self.get_bool()? {
            self.get_string().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn get_fixed_opaque<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        self.skip_padding(N)?;
        Ok(out)
    }

    /// Length prefix of a variable-size array.
    pub fn get_array_len(&mut self) -> Result<u32> {
        let len = self.get_u32()?;
        if len > MAX_ARRAY {
            return Err(StoreError::Protocol(format!("XDR array of {} items", len)));
        }
        Ok(len)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
