//! Frame codec: byte stream to logical payloads and back.
//!
//! Inbound bytes accumulate in a [`FrameDecoder`]. A logical payload is
//! handed out only once every frame of its continuation chain is buffered,
//! so a short read never leaves the decoder half-advanced.

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};
use mywire_core::Result;
use mywire_core::error::{Error, ProtocolError};

/// True iff `buf` holds a header plus the full payload it declares.
pub fn has_complete_frame(buf: &[u8]) -> bool {
    match read_header(buf) {
        Some(header) => buf.len() >= PacketHeader::SIZE + header.payload_length as usize,
        None => false,
    }
}

/// Decode the header at the start of `buf`, if four bytes are present.
pub fn read_header(buf: &[u8]) -> Option<PacketHeader> {
    let bytes: &[u8; 4] = buf.get(..PacketHeader::SIZE)?.try_into().ok()?;
    Some(PacketHeader::from_bytes(bytes))
}

/// Fill a previously reserved 4-byte header slot.
pub fn write_header(slot: &mut [u8], payload_length: usize, sequence_id: u8) {
    let header = PacketHeader {
        payload_length: payload_length as u32,
        sequence_id,
    };
    slot[..PacketHeader::SIZE].copy_from_slice(&header.to_bytes());
}

/// Append `payload` to `out` as one or more frames starting at
/// `sequence_id`. Returns the sequence id following the last frame.
///
/// A payload that is an exact multiple of the maximum frame size (including
/// zero) ends with an empty frame.
pub fn write_frames(out: &mut Vec<u8>, mut sequence_id: u8, payload: &[u8]) -> u8 {
    let mut chunks = payload.chunks(MAX_PACKET_SIZE);
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        let slot = out.len();
        out.extend_from_slice(&[0; PacketHeader::SIZE]);
        out.extend_from_slice(chunk);
        write_header(&mut out[slot..], chunk.len(), sequence_id);
        sequence_id = sequence_id.wrapping_add(1);
        if chunk.len() < MAX_PACKET_SIZE {
            return sequence_id;
        }
    }
}

/// One logical payload reassembled from its frame chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedPayload {
    pub payload: Vec<u8>,
    /// Sequence id of the first frame
    pub first_seq: u8,
    /// Sequence id of the last frame
    pub last_seq: u8,
    /// Number of frames in the chain
    pub frames: usize,
}

/// Reassemble the payload at the start of `buf`.
///
/// Returns `Ok(None)` when the chain is not fully buffered, and the number
/// of bytes the chain occupies otherwise.
pub fn read_joined_payload(buf: &[u8]) -> Result<Option<(JoinedPayload, usize)>> {
    let mut pos = 0;
    let mut payload = Vec::new();
    let mut first_seq = None;
    let mut last_seq = 0u8;
    let mut frames = 0;

    loop {
        let rest = &buf[pos..];
        if !has_complete_frame(rest) {
            return Ok(None);
        }
        let Some(header) = read_header(rest) else {
            return Ok(None);
        };
        let len = header.payload_length as usize;

        match first_seq {
            None => first_seq = Some(header.sequence_id),
            Some(_) if header.sequence_id != last_seq.wrapping_add(1) => {
                return Err(sequence_error(
                    last_seq.wrapping_add(1),
                    header.sequence_id,
                ));
            }
            Some(_) => {}
        }
        last_seq = header.sequence_id;
        frames += 1;

        let body = &rest[PacketHeader::SIZE..PacketHeader::SIZE + len];
        if frames == 1 && len < MAX_PACKET_SIZE {
            payload = body.to_vec();
        } else {
            payload.extend_from_slice(body);
        }
        pos += PacketHeader::SIZE + len;

        if len < MAX_PACKET_SIZE {
            let joined = JoinedPayload {
                payload,
                first_seq: first_seq.unwrap_or(last_seq),
                last_seq,
                frames,
            };
            return Ok(Some((joined, pos)));
        }
    }
}

pub(crate) fn sequence_error(expected: u8, actual: u8) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("packet sequence mismatch: expected {expected}, got {actual}"),
        raw_data: None,
        source: None,
    })
}

/// Cumulative receive buffer with incremental frame extraction.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > 64 * 1024 && self.start * 2 > self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn has_complete_frame(&self) -> bool {
        has_complete_frame(&self.buf[self.start..])
    }

    /// Extract the next complete logical payload.
    ///
    /// On error nothing is consumed.
    pub fn next_payload(&mut self) -> Result<Option<JoinedPayload>> {
        match read_joined_payload(&self.buf[self.start..])? {
            Some((joined, used)) => {
                self.start += used;
                tracing::trace!(
                    seq = joined.first_seq,
                    len = joined.payload.len(),
                    frames = joined.frames,
                    "frame received"
                );
                Ok(Some(joined))
            }
            None => Ok(None),
        }
    }

    /// Header of the next frame, without consuming it.
    pub fn peek_header(&self) -> Option<PacketHeader> {
        read_header(&self.buf[self.start..])
    }

    /// Consume the next frame header, leaving its body buffered.
    pub fn take_header(&mut self) -> Option<PacketHeader> {
        let header = self.peek_header()?;
        self.start += PacketHeader::SIZE;
        Some(header)
    }

    /// Consume up to `max` buffered body bytes.
    ///
    /// Used after [`take_header`](Self::take_header) to hand a large frame
    /// on as it arrives instead of waiting for all of it.
    pub fn take_body(&mut self, max: usize) -> &[u8] {
        let n = max.min(self.buffered());
        let from = self.start;
        self.start += n;
        &self.buf[from..from + n]
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }
}
