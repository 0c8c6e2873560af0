use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{read_u8, Error, FixedHeader};

/// The broker's reply to a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Only ever `true` when an existing non-clean session was resumed.
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    fn from_u8(code: u8) -> Result<ConnectReturnCode, Error> {
        match code {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUsernameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            code => Err(Error::InvalidConnectReturnCode(code)),
        }
    }
}

pub fn read(fixed_header: FixedHeader, mut frame: Bytes) -> Result<ConnAck, Error> {
    if fixed_header.remaining_len() != 2 {
        return Err(Error::MalformedPacket);
    }

    frame.advance(fixed_header.fixed_header_len());

    let flags = read_u8(&mut frame)?;
    // Bits 7..1 of the acknowledge flags are reserved [MQTT-3.2.2-1].
    if flags & !0x01 != 0 {
        return Err(Error::MalformedPacket);
    }

    let code = ConnectReturnCode::from_u8(read_u8(&mut frame)?)?;

    Ok(ConnAck {
        session_present: flags & 0x01 != 0,
        code,
    })
}

pub fn write(connack: &ConnAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(0x20);
    buffer.put_u8(0x02);
    buffer.put_u8(connack.session_present as u8);
    buffer.put_u8(connack.code as u8);
    Ok(4)
}
