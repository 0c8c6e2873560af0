use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    read_mqtt_bytes, read_mqtt_string, read_u16, read_u8, write_mqtt_bytes, write_mqtt_string,
    write_remaining_length, Error, FixedHeader, QoS,
};

/// A CONNECT packet: the handshake a client opens every session with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Seconds between client packets before the broker may drop the
    /// connection (after a 1.5x grace). Zero disables the timeout.
    pub keep_alive: u16,
    /// May be empty on the wire; whether that is acceptable is broker policy.
    pub client_id: String,
    pub clean_session: bool,
    pub last_will: Option<LastWill>,
    pub login: Option<Login>,
}

/// The will message the broker publishes if the connection dies abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: String,
}

pub fn read(fixed_header: FixedHeader, mut frame: Bytes) -> Result<Connect, Error> {
    frame.advance(fixed_header.fixed_header_len());

    let protocol_name = read_mqtt_string(&mut frame)?;
    if protocol_name != "MQTT" {
        return Err(Error::InvalidProtocol);
    }

    let protocol_level = read_u8(&mut frame)?;
    if protocol_level != 4 {
        return Err(Error::InvalidProtocolLevel(protocol_level));
    }

    let connect_flags = read_u8(&mut frame)?;

    // Bit 0 of the connect flags is reserved and must be zero [MQTT-3.1.2-3].
    if connect_flags & 0b0000_0001 != 0 {
        return Err(Error::MalformedPacket);
    }

    let clean_session = connect_flags & 0b0000_0010 != 0;
    let will_flag = connect_flags & 0b0000_0100 != 0;
    let will_qos = (connect_flags & 0b0001_1000) >> 3;
    let will_retain = connect_flags & 0b0010_0000 != 0;
    let password_flag = connect_flags & 0b0100_0000 != 0;
    let username_flag = connect_flags & 0b1000_0000 != 0;

    // Without a will there must be no will QoS or retain [MQTT-3.1.2-11..15].
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(Error::MalformedPacket);
    }

    // A password requires a username [MQTT-3.1.2-22].
    if password_flag && !username_flag {
        return Err(Error::MalformedPacket);
    }

    let keep_alive = read_u16(&mut frame)?;

    let client_id = read_mqtt_string(&mut frame)?;

    let last_will = if will_flag {
        let topic = read_mqtt_string(&mut frame)?;
        let message = read_mqtt_bytes(&mut frame)?;
        Some(LastWill {
            topic,
            message,
            qos: QoS::from_u8(will_qos)?,
            retain: will_retain,
        })
    } else {
        None
    };

    let login = if username_flag {
        let username = read_mqtt_string(&mut frame)?;
        let password = if password_flag {
            read_mqtt_string(&mut frame)?
        } else {
            String::new()
        };
        Some(Login { username, password })
    } else {
        None
    };

    if frame.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    Ok(Connect {
        keep_alive,
        client_id,
        clean_session,
        last_will,
        login,
    })
}

fn len(connect: &Connect) -> usize {
    // Protocol name, level, connect flags, keep alive.
    let mut len = 2 + 4 + 1 + 1 + 2;

    len += 2 + connect.client_id.len();

    if let Some(will) = &connect.last_will {
        len += 2 + will.topic.len() + 2 + will.message.len();
    }

    if let Some(login) = &connect.login {
        len += 2 + login.username.len();
        if !login.password.is_empty() {
            len += 2 + login.password.len();
        }
    }

    len
}

pub fn write(connect: &Connect, buffer: &mut BytesMut) -> Result<usize, Error> {
    let remaining_len = len(connect);

    buffer.put_u8(0x10);
    let len_len = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, "MQTT");
    buffer.put_u8(4);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0b0000_0010;
    }
    if let Some(will) = &connect.last_will {
        connect_flags |= 0b0000_0100 | (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0b0010_0000;
        }
    }
    if let Some(login) = &connect.login {
        connect_flags |= 0b1000_0000;
        if !login.password.is_empty() {
            connect_flags |= 0b0100_0000;
        }
    }
    buffer.put_u8(connect_flags);

    buffer.put_u16(connect.keep_alive);
    write_mqtt_string(buffer, &connect.client_id);

    if let Some(will) = &connect.last_will {
        write_mqtt_string(buffer, &will.topic);
        write_mqtt_bytes(buffer, &will.message);
    }

    if let Some(login) = &connect.login {
        write_mqtt_string(buffer, &login.username);
        if !login.password.is_empty() {
            write_mqtt_string(buffer, &login.password);
        }
    }

    Ok(1 + len_len + remaining_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_mut, to_bytes, Packet};
    use bytes::BytesMut;

    fn decode(bytes: &[u8]) -> Result<Packet, Error> {
        let mut stream = BytesMut::from(bytes);
        read_mut(&mut stream, usize::MAX)
    }

    #[test]
    fn connect_round_trip() {
        let packet = Packet::Connect(Connect {
            keep_alive: 60,
            client_id: "sensor-7".into(),
            clean_session: true,
            last_will: Some(LastWill {
                topic: "last".into(),
                message: Bytes::from_static(b"bye"),
                qos: QoS::AtLeastOnce,
                retain: false,
            }),
            login: Some(Login {
                username: "probe".into(),
                password: "hunter2".into(),
            }),
        });

        let bytes = to_bytes(&packet).unwrap();
        let mut stream = BytesMut::from(&bytes[..]);
        let decoded = read_mut(&mut stream, usize::MAX).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(to_bytes(&decoded).unwrap(), bytes);
    }

    #[test]
    fn connect_minimal_round_trip() {
        let packet = Packet::Connect(Connect {
            keep_alive: 0,
            client_id: "c1".into(),
            clean_session: false,
            last_will: None,
            login: None,
        });

        let bytes = to_bytes(&packet).unwrap();
        let mut stream = BytesMut::from(&bytes[..]);
        assert_eq!(read_mut(&mut stream, usize::MAX).unwrap(), packet);
    }

    #[test]
    fn decodes_clean_session_connect_with_empty_client_id() {
        // CONNECT, MQTT level 4, clean session, keep alive 60, empty id.
        let bytes = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];

        let Packet::Connect(connect) = decode(&bytes).unwrap() else {
            panic!("expected CONNECT");
        };

        assert!(connect.client_id.is_empty());
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 60);
    }

    #[test]
    fn rejects_wrong_protocol_name() {
        let bytes = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'I', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];
        assert_eq!(decode(&bytes), Err(Error::InvalidProtocol));
    }

    #[test]
    fn rejects_protocol_level_three() {
        let bytes = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];
        assert_eq!(decode(&bytes), Err(Error::InvalidProtocolLevel(3)));
    }

    #[test]
    fn rejects_reserved_connect_flag_bit() {
        let bytes = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x00,
        ];
        assert_eq!(decode(&bytes), Err(Error::MalformedPacket));
    }

    #[test]
    fn rejects_will_qos_without_will_flag() {
        // QoS 1 in the will bits but no will flag.
        let bytes = [
            0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x0A, 0x00, 0x3C, 0x00, 0x00,
        ];
        assert_eq!(decode(&bytes), Err(Error::MalformedPacket));
    }
}
