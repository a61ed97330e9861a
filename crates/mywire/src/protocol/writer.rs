//! Payload builder for outbound packets.

use crate::protocol::frame;

/// A writer for MySQL protocol data.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u48_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..6]);
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// 251 (0xFB) and up take the prefixed forms, so the NULL marker is
    /// never emitted as a literal.
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.write_null_bytes(s.as_bytes());
    }

    pub fn write_null_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0);
    }

    /// Write exactly `len` bytes, truncating or zero padding.
    pub fn write_fixed_string(&mut self, s: &str, len: usize) {
        let bytes = s.as_bytes();
        let take = bytes.len().min(len);
        self.buffer.extend_from_slice(&bytes[..take]);
        self.write_zeros(len - take);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    /// Frame the payload starting at `sequence_id`, splitting at the
    /// maximum frame size. Returns the wire bytes and the next sequence id.
    pub fn build_packet(&self, sequence_id: u8) -> (Vec<u8>, u8) {
        let mut out = Vec::with_capacity(self.buffer.len() + 4);
        let next = frame::write_frames(&mut out, sequence_id, &self.buffer);
        (out, next)
    }
}
