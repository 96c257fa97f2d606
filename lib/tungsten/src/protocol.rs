use crate::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ember::{SessionId, Usn};
use std::io;
use std::io::{Read, Write};

pub const PKT_MOVE: u16 = 1;
pub const PKT_LOGIN_REQ: u16 = 100;
pub const PKT_LOGIN_RES: u16 = 101;

/// Framed packet header. `size` is the total framed size, header included,
/// and must lie in `[PACKET_HEADER_SIZE, MAX_PACKET_SIZE]`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub size: u16,
    pub protocol_id: u16,
}

impl PacketHeader {
    #[inline]
    pub fn new(size: u16, protocol_id: u16) -> PacketHeader {
        PacketHeader { size, protocol_id }
    }

    /// Decodes a header from the first four bytes without consuming them.
    /// Returns `None` when fewer than four bytes are available.
    #[inline]
    pub fn peek(bytes: &[u8]) -> Option<PacketHeader> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return None;
        }

        Some(PacketHeader {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    #[inline]
    pub fn read<R: Read>(stream: &mut R) -> io::Result<PacketHeader> {
        Ok(PacketHeader {
            size: stream.read_u16::<LittleEndian>()?,
            protocol_id: stream.read_u16::<LittleEndian>()?,
        })
    }

    #[inline]
    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u16::<LittleEndian>(self.size)?;
        stream.write_u16::<LittleEndian>(self.protocol_id)
    }

    /// True when the framed size is inside the protocol bounds.
    #[inline]
    pub fn is_valid_size(&self) -> bool {
        let size = self.size as usize;
        size >= PACKET_HEADER_SIZE && size <= MAX_PACKET_SIZE
    }
}

#[inline]
fn check_protocol(header: PacketHeader, expected: u16) -> io::Result<()> {
    if header.protocol_id != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Protocol id mismatch: expected {}, got {}",
                expected, header.protocol_id
            ),
        ));
    }

    Ok(())
}

/// Client movement report, broadcast to everyone else on the same map.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MovePacket {
    pub client_id: u32,
    pub pos_x: f32,
    pub pos_y: f32,
    pub velocity_x: f32,
    pub velocity_y: f32,
    pub timestamp: u32,
}

impl MovePacket {
    pub const SIZE: usize = PACKET_HEADER_SIZE + 24;

    pub fn read<R: Read>(stream: &mut R) -> io::Result<MovePacket> {
        let header = PacketHeader::read(stream)?;
        check_protocol(header, PKT_MOVE)?;

        Ok(MovePacket {
            client_id: stream.read_u32::<LittleEndian>()?,
            pos_x: stream.read_f32::<LittleEndian>()?,
            pos_y: stream.read_f32::<LittleEndian>()?,
            velocity_x: stream.read_f32::<LittleEndian>()?,
            velocity_y: stream.read_f32::<LittleEndian>()?,
            timestamp: stream.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        PacketHeader::new(Self::SIZE as u16, PKT_MOVE).write(stream)?;
        stream.write_u32::<LittleEndian>(self.client_id)?;
        stream.write_f32::<LittleEndian>(self.pos_x)?;
        stream.write_f32::<LittleEndian>(self.pos_y)?;
        stream.write_f32::<LittleEndian>(self.velocity_x)?;
        stream.write_f32::<LittleEndian>(self.velocity_y)?;
        stream.write_u32::<LittleEndian>(self.timestamp)
    }
}

/// Login request. A zero token asks for a fresh session; a non-zero token
/// claims an existing one through the resume policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoginPacket {
    pub usn: Usn,
    pub token: u64,
    pub is_reconnect: bool,
}

impl LoginPacket {
    pub const SIZE: usize = PACKET_HEADER_SIZE + 17;

    pub fn read<R: Read>(stream: &mut R) -> io::Result<LoginPacket> {
        let header = PacketHeader::read(stream)?;
        check_protocol(header, PKT_LOGIN_REQ)?;

        Ok(LoginPacket {
            usn: stream.read_u64::<LittleEndian>()?,
            token: stream.read_u64::<LittleEndian>()?,
            is_reconnect: stream.read_u8()? != 0,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        PacketHeader::new(Self::SIZE as u16, PKT_LOGIN_REQ).write(stream)?;
        stream.write_u64::<LittleEndian>(self.usn)?;
        stream.write_u64::<LittleEndian>(self.token)?;
        stream.write_u8(self.is_reconnect as u8)
    }
}

/// Login response carrying the session id and the resume token the client
/// must present to reattach after a disconnect.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoginResponsePacket {
    pub session_id: SessionId,
    pub token: u64,
    pub success: bool,
}

impl LoginResponsePacket {
    pub const SIZE: usize = PACKET_HEADER_SIZE + 17;

    pub fn read<R: Read>(stream: &mut R) -> io::Result<LoginResponsePacket> {
        let header = PacketHeader::read(stream)?;
        check_protocol(header, PKT_LOGIN_RES)?;

        Ok(LoginResponsePacket {
            session_id: stream.read_u64::<LittleEndian>()?,
            token: stream.read_u64::<LittleEndian>()?,
            success: stream.read_u8()? != 0,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        PacketHeader::new(Self::SIZE as u16, PKT_LOGIN_RES).write(stream)?;
        stream.write_u64::<LittleEndian>(self.session_id)?;
        stream.write_u64::<LittleEndian>(self.token)?;
        stream.write_u8(self.success as u8)
    }
}

/// Reserved: reasons a login is refused. Enumerated for the wire contract,
/// not dispatched by the core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum LoginFailReason {
    None = 0,
    WrongPassword = 1,
    AlreadyConnected = 2,
}

/// Reserved: reasons a connected client is kicked.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum KickReason {
    DuplicateLogin = 0,
    GmBan = 1,
}

/// Reserved: login refusal notice. Part of the wire contract, not
/// dispatched by the core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoginFailPacket {
    pub reason: LoginFailReason,
}

/// Reserved: forced disconnect notice. Part of the wire contract, not
/// dispatched by the core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KickPacket {
    pub reason: KickReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_peek() {
        let bytes = [28u8, 0, 1, 0, 0xff];

        let header = PacketHeader::peek(&bytes).unwrap();

        assert_eq!(header.size, 28);
        assert_eq!(header.protocol_id, PKT_MOVE);
        assert!(header.is_valid_size());
    }

    #[test]
    fn test_header_peek_short() {
        assert_eq!(PacketHeader::peek(&[1, 2, 3]), None);
    }

    #[test]
    fn test_header_size_bounds() {
        assert!(!PacketHeader::new(3, 0).is_valid_size());
        assert!(PacketHeader::new(4, 0).is_valid_size());
        assert!(PacketHeader::new(2048, 0).is_valid_size());
        assert!(!PacketHeader::new(2049, 0).is_valid_size());
    }

    #[test]
    fn test_move_roundtrip() {
        let packet = MovePacket {
            client_id: 7,
            pos_x: 1.5,
            pos_y: -2.5,
            velocity_x: 0.25,
            velocity_y: 100.0,
            timestamp: 123456,
        };

        let mut bytes = Vec::new();
        packet.write(&mut bytes).unwrap();

        assert_eq!(bytes.len(), MovePacket::SIZE);
        assert_eq!(MovePacket::SIZE, 28);

        let decoded = MovePacket::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_login_roundtrip() {
        let packet = LoginPacket {
            usn: 7,
            token: 0xdead_beef,
            is_reconnect: true,
        };

        let mut bytes = Vec::new();
        packet.write(&mut bytes).unwrap();

        assert_eq!(bytes.len(), LoginPacket::SIZE);

        let decoded = LoginPacket::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_login_response_roundtrip() {
        let packet = LoginResponsePacket {
            session_id: 42,
            token: 99,
            success: true,
        };

        let mut bytes = Vec::new();
        packet.write(&mut bytes).unwrap();

        assert_eq!(bytes.len(), LoginResponsePacket::SIZE);

        let decoded = LoginResponsePacket::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_protocol_mismatch_is_an_error() {
        let packet = LoginPacket {
            usn: 1,
            token: 0,
            is_reconnect: false,
        };

        let mut bytes = Vec::new();
        packet.write(&mut bytes).unwrap();

        let result = MovePacket::read(&mut Cursor::new(&bytes));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
