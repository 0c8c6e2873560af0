use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::v4::write_header;
use crate::{read_mqtt_string, read_u16, write_mqtt_string, Error, FixedHeader};

/// An UNSUBSCRIBE request: one or more topic filters to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

pub fn read(fixed_header: FixedHeader, mut frame: Bytes) -> Result<Unsubscribe, Error> {
    frame.advance(fixed_header.fixed_header_len());

    let pkid = read_u16(&mut frame)?;

    let mut filters = Vec::new();
    while frame.has_remaining() {
        filters.push(read_mqtt_string(&mut frame)?);
    }

    // An UNSUBSCRIBE with no filters is a protocol violation [MQTT-3.10.3-2].
    if filters.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(Unsubscribe { pkid, filters })
}

fn len(unsubscribe: &Unsubscribe) -> usize {
    2 + unsubscribe
        .filters
        .iter()
        .map(|filter| 2 + filter.len())
        .sum::<usize>()
}

pub fn write(unsubscribe: &Unsubscribe, buffer: &mut BytesMut) -> Result<usize, Error> {
    let written = write_header(0xA2, len(unsubscribe), buffer)?;

    buffer.put_u16(unsubscribe.pkid);
    for filter in &unsubscribe.filters {
        write_mqtt_string(buffer, filter);
    }

    Ok(written)
}
