use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length, Error, FixedHeader, QoS,
};

/// An application message, inbound from a publisher or outbound to a
/// subscriber. The payload is opaque bytes and may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Nonzero iff `qos` is above [`QoS::AtMostOnce`].
    pub pkid: u16,
    pub payload: Bytes,
}

pub fn read(fixed_header: FixedHeader, mut frame: Bytes) -> Result<Publish, Error> {
    let flags = fixed_header.flags();
    let dup = flags & 0b1000 != 0;
    let qos = QoS::from_u8((flags & 0b0110) >> 1)?;
    let retain = flags & 0b0001 != 0;

    // A QoS 0 message cannot be a re-delivery [MQTT-3.3.1-2].
    if qos == QoS::AtMostOnce && dup {
        return Err(Error::MalformedPacket);
    }

    frame.advance(fixed_header.fixed_header_len());

    let topic = read_mqtt_string(&mut frame)?;

    let pkid = if qos == QoS::AtMostOnce {
        0
    } else {
        read_u16(&mut frame)?
    };

    // Whatever is left of the frame is the application payload.
    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        pkid,
        payload: frame,
    })
}

fn len(publish: &Publish) -> usize {
    let mut len = 2 + publish.topic.len() + publish.payload.len();
    if publish.qos != QoS::AtMostOnce {
        len += 2;
    }

    len
}

pub fn write(publish: &Publish, buffer: &mut BytesMut) -> Result<usize, Error> {
    let remaining_len = len(publish);

    let mut byte1 = 0x30;
    if publish.dup {
        byte1 |= 0b1000;
    }
    byte1 |= (publish.qos as u8) << 1;
    if publish.retain {
        byte1 |= 0b0001;
    }

    buffer.reserve(1 + 4 + remaining_len);
    buffer.put_u8(byte1);
    let len_len = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, &publish.topic);
    if publish.qos != QoS::AtMostOnce {
        buffer.put_u16(publish.pkid);
    }
    buffer.extend_from_slice(&publish.payload);

    Ok(1 + len_len + remaining_len)
}
