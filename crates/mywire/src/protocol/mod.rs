//! MySQL wire protocol: frames, scalar codecs and packet layouts.
//!
//! Every frame carries a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence id
//!
//! A payload of exactly 2^24 - 1 bytes means the logical payload continues
//! in the next frame. See [`frame`] for reassembly.

pub mod frame;
pub mod handshake;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use frame::{FrameDecoder, JoinedPayload, has_complete_frame, read_header, write_header};
pub use reader::{LenEnc, PacketReader};
pub use writer::PacketWriter;

use mywire_core::error::{Error, QueryError, QueryErrorKind};

/// Maximum payload size for a single frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags exchanged during the handshake.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_OPTIONAL_RESULTSET_METADATA: u32 = 1 << 25;

    /// What this engine asks for by default; the negotiated set is the
    /// intersection with the server's advertisement.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_ATTRS
        | CLIENT_DEPRECATE_EOF;
}

/// Command bytes (COM_xxx) sent as the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    /// No server response
    StmtSendLongData = 0x18,
    /// No server response
    StmtClose = 0x19,
    StmtReset = 0x1a,
    StmtFetch = 0x1c,
    ResetConnection = 0x1f,
}

impl Command {
    /// Does the server answer this command?
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtSendLongData | Command::StmtClose
        )
    }
}

/// Server status flags carried by OK and EOF packets.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Collation ids used on the wire.
///
/// Name tables live outside this crate; only the ids the engine itself
/// needs are listed.
pub mod collation {
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    pub const DEFAULT: u8 = UTF8MB4_0900_AI_CI;
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (24 bits)
    pub payload_length: u32,
    /// Sequence id (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Response classification by first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// ERR packet (0xFF)
    Error,
    /// EOF packet (0xFE, payload shorter than 9 bytes)
    Eof,
    /// LOCAL INFILE request (0xFB)
    LocalInfile,
    /// Anything else: column count, row, column definition
    Data,
}

impl PacketType {
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    pub fn of(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(PacketType::Data, |b| Self::from_first_byte(*b, payload.len()))
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// Five characters, empty on pre-4.1 servers
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// Convert into the typed server error.
    pub fn into_error(self) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::from_code(self.error_code),
            code: self.error_code,
            sqlstate: (!self.sql_state.is_empty()).then_some(self.sql_state),
            message: self.error_message,
        })
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// Parse an ERR payload into a typed error, or a protocol error if the
/// payload is truncated.
pub fn server_error(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => err.into_error(),
        None => malformed("ERR packet", payload),
    }
}

/// Protocol error for a payload that does not match its expected layout.
pub fn malformed(what: &str, payload: &[u8]) -> Error {
    Error::Protocol(mywire_core::ProtocolError {
        message: format!("malformed {what} ({} bytes)", payload.len()),
        raw_data: Some(payload.iter().take(64).copied().collect()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        for len in [0_u32, 1, 250, 251, 0xFFFF, 0x1_0000, 0x12_3456, 0xFF_FFFE] {
            for seq in [0_u8, 1, 127, 255] {
                let header = PacketHeader {
                    payload_length: len,
                    sequence_id: seq,
                };
                assert_eq!(PacketHeader::from_bytes(&header.to_bytes()), header);
            }
        }
    }

    #[test]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(
            PacketType::from_first_byte(0xFB, 10),
            PacketType::LocalInfile
        );
        assert_eq!(PacketType::from_first_byte(0x03, 1), PacketType::Data);
        assert_eq!(PacketType::of(&[]), PacketType::Data);
    }

    #[test]
    fn test_err_packet_into_error() {
        let mut payload = vec![0xFF, 0x15, 0x04, b'#'];
        payload.extend_from_slice(b"28000Access denied");
        let err = server_error(&payload);
        assert_eq!(err.code(), Some(1045));
        assert_eq!(err.sqlstate(), Some("28000"));
        assert!(!err.is_fatal());

        let truncated = server_error(&[0xFF, 0x15]);
        assert!(matches!(truncated, Error::Protocol(_)));
    }

    #[test]
    fn test_commands_without_response() {
        assert!(!Command::StmtSendLongData.expects_response());
        assert!(!Command::StmtClose.expects_response());
        assert!(!Command::Quit.expects_response());
        assert!(Command::StmtReset.expects_response());
        assert!(Command::Ping.expects_response());
    }
}
