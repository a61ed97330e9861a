//! Connection-phase packet layouts: initial handshake, SSL request,
//! handshake response and auth switch.

use crate::protocol::capabilities::{
    CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_SECURE_CONNECTION, CLIENT_SSL,
};
use crate::protocol::reader::need;
use crate::protocol::{PacketReader, PacketWriter};
use mywire_core::{Error, Result};

/// Initial handshake (protocol version 10) sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble: part 1 (8 bytes) followed by part 2, trailing NUL removed
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub collation: u8,
    pub status_flags: u16,
    /// Empty when the server does not speak CLIENT_PLUGIN_AUTH
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = need(reader.read_u8(), "handshake", payload)?;
        if protocol_version != 10 {
            return Err(Error::protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }

        let server_version = reader.read_null_string();
        let connection_id = need(reader.read_u32_le(), "handshake connection id", payload)?;
        let auth_data_1 = need(reader.read_bytes(8), "handshake auth data", payload)?;
        reader.skip(1);

        let caps_lower = need(reader.read_u16_le(), "handshake capabilities", payload)?;
        let mut handshake = InitialHandshake {
            protocol_version,
            server_version,
            connection_id,
            auth_data: auth_data_1.to_vec(),
            capabilities: u32::from(caps_lower),
            collation: 0,
            status_flags: 0,
            auth_plugin: String::new(),
        };

        // Pre-4.1 servers stop here.
        if reader.is_empty() {
            return Ok(handshake);
        }

        handshake.collation = need(reader.read_u8(), "handshake collation", payload)?;
        handshake.status_flags = need(reader.read_u16_le(), "handshake status", payload)?;
        let caps_upper = need(reader.read_u16_le(), "handshake capabilities", payload)?;
        handshake.capabilities |= u32::from(caps_upper) << 16;

        let auth_data_len = usize::from(need(reader.read_u8(), "handshake auth length", payload)?);
        need(
            reader.skip(10).then_some(()),
            "handshake reserved bytes",
            payload,
        )?;

        if handshake.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13);
            let part2 = reader
                .read_bytes(len2)
                .unwrap_or_else(|| reader.read_rest());
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            handshake.auth_data.extend_from_slice(part2);
        }

        if handshake.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            // Servers before 5.5.10 / 5.6.2 omit the terminator; the name
            // then runs to the end of the payload.
            handshake.auth_plugin = reader.read_null_string();
        }

        Ok(handshake)
    }
}

/// Client reply to the initial handshake.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    /// Encode the payload (without frame header).
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::new();

        write_fixed_prefix(&mut writer, caps, self.max_packet_size, self.collation);
        writer.write_null_string(self.user);

        if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & CLIENT_SECURE_CONNECTION != 0 {
            let len = u8::try_from(self.auth_response.len()).map_err(|_| {
                Error::auth("auth response longer than 255 bytes needs lenenc client data")
            })?;
            writer.write_u8(len);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_null_bytes(self.auth_response);
        }

        if caps & CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }

        if caps & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }

        if caps & CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }

        Ok(writer.into_bytes())
    }
}

/// The 32-byte SSL request sent before upgrading the transport.
pub fn ssl_request_payload(capabilities: u32, max_packet_size: u32, collation: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    write_fixed_prefix(
        &mut writer,
        capabilities | CLIENT_SSL,
        max_packet_size,
        collation,
    );
    writer.into_bytes()
}

fn write_fixed_prefix(writer: &mut PacketWriter, caps: u32, max_packet_size: u32, collation: u8) {
    writer.write_u32_le(caps);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(collation);
    writer.write_zeros(23);
}

/// 0xFE auth switch request: plugin name and fresh challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        need(
            (reader.read_u8() == Some(0xFE)).then_some(()),
            "auth switch request",
            payload,
        )?;
        let plugin = reader.read_null_string();
        let data = reader.read_rest();
        let data = data.strip_suffix(&[0]).unwrap_or(data);
        Ok(Self {
            plugin,
            data: data.to_vec(),
        })
    }
}
