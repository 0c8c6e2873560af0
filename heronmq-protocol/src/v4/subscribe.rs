use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::v4::write_header;
use crate::{read_mqtt_string, read_u16, read_u8, write_mqtt_string, Error, FixedHeader, QoS};

/// A SUBSCRIBE request: one or more topic filters with requested QoS levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

pub fn read(fixed_header: FixedHeader, mut frame: Bytes) -> Result<Subscribe, Error> {
    frame.advance(fixed_header.fixed_header_len());

    let pkid = read_u16(&mut frame)?;

    let mut filters = Vec::new();
    while frame.has_remaining() {
        let path = read_mqtt_string(&mut frame)?;
        let options = read_u8(&mut frame)?;

        // Bits 7..2 of the subscription options are reserved [MQTT-3.8.3-4].
        if options & !0b0000_0011 != 0 {
            return Err(Error::MalformedPacket);
        }

        filters.push(SubscribeFilter {
            path,
            qos: QoS::from_u8(options)?,
        });
    }

    // A SUBSCRIBE with no filters is a protocol violation [MQTT-3.8.3-3].
    if filters.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(Subscribe { pkid, filters })
}

fn len(subscribe: &Subscribe) -> usize {
    2 + subscribe
        .filters
        .iter()
        .map(|filter| 2 + filter.path.len() + 1)
        .sum::<usize>()
}

pub fn write(subscribe: &Subscribe, buffer: &mut BytesMut) -> Result<usize, Error> {
    let written = write_header(0x82, len(subscribe), buffer)?;

    buffer.put_u16(subscribe.pkid);
    for filter in &subscribe.filters {
        write_mqtt_string(buffer, &filter.path);
        buffer.put_u8(filter.qos as u8);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_mut, to_bytes, Packet};
    use bytes::BytesMut;

    #[test]
    fn subscribe_round_trip() {
        let packet = Packet::Subscribe(Subscribe {
            pkid: 1,
            filters: vec![
                SubscribeFilter {
                    path: "sport/#".into(),
                    qos: QoS::AtMostOnce,
                },
                SubscribeFilter {
                    path: "a/+/c".into(),
                    qos: QoS::ExactlyOnce,
                },
            ],
        });

        let bytes = to_bytes(&packet).unwrap();
        let mut stream = BytesMut::from(&bytes[..]);
        let decoded = read_mut(&mut stream, usize::MAX).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(to_bytes(&decoded).unwrap(), bytes);
    }

    #[test]
    fn rejects_empty_filter_list() {
        // SUBSCRIBE with only a packet id.
        let mut stream = BytesMut::from(&[0x82, 0x02, 0x00, 0x01][..]);
        assert_eq!(
            read_mut(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        );
    }

    #[test]
    fn rejects_requested_qos_three() {
        let mut stream = BytesMut::from(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x03][..]);
        assert_eq!(read_mut(&mut stream, usize::MAX), Err(Error::InvalidQoS(3)));
    }

    #[test]
    fn rejects_reserved_option_bits() {
        let mut stream = BytesMut::from(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x04][..]);
        assert_eq!(
            read_mut(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        );
    }
}
