use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::v4::write_header;
use crate::{read_u16, read_u8, Error, FixedHeader, QoS};

/// The broker's per-filter verdict on a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    fn from_u8(code: u8) -> Result<SubscribeReturnCode, Error> {
        match code {
            0 => Ok(SubscribeReturnCode::Success(QoS::AtMostOnce)),
            1 => Ok(SubscribeReturnCode::Success(QoS::AtLeastOnce)),
            2 => Ok(SubscribeReturnCode::Success(QoS::ExactlyOnce)),
            0x80 => Ok(SubscribeReturnCode::Failure),
            code => Err(Error::InvalidSubscribeReturnCode(code)),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            // Return codes other than 0x00..0x02 and 0x80 are reserved
            // [MQTT-3.9.3-2].
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

pub fn read(fixed_header: FixedHeader, mut frame: Bytes) -> Result<SubAck, Error> {
    frame.advance(fixed_header.fixed_header_len());

    let pkid = read_u16(&mut frame)?;

    let mut return_codes = Vec::new();
    while frame.has_remaining() {
        return_codes.push(SubscribeReturnCode::from_u8(read_u8(&mut frame)?)?);
    }

    if return_codes.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(SubAck { pkid, return_codes })
}

pub fn write(suback: &SubAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    let written = write_header(0x90, 2 + suback.return_codes.len(), buffer)?;

    buffer.put_u16(suback.pkid);
    for &code in &suback.return_codes {
        buffer.put_u8(code.as_u8());
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_mut, to_bytes, Packet};
    use bytes::BytesMut;

    #[test]
    fn suback_round_trip() {
        let packet = Packet::SubAck(SubAck {
            pkid: 1,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtMostOnce),
                SubscribeReturnCode::Success(QoS::ExactlyOnce),
                SubscribeReturnCode::Failure,
            ],
        });

        let bytes = to_bytes(&packet).unwrap();
        let mut stream = BytesMut::from(&bytes[..]);
        let decoded = read_mut(&mut stream, usize::MAX).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(to_bytes(&decoded).unwrap(), bytes);
    }

    #[test]
    fn failure_encodes_as_0x80() {
        let bytes = to_bytes(&Packet::SubAck(SubAck {
            pkid: 3,
            return_codes: vec![SubscribeReturnCode::Failure],
        }))
        .unwrap();

        assert_eq!(&bytes[..], [0x90, 0x03, 0x00, 0x03, 0x80]);
    }
}
