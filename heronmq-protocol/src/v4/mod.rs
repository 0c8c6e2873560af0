//! Per-packet readers and writers for protocol level 4.
//!
//! Each submodule follows the same shape: a `read(fixed_header, frame)` that
//! consumes a complete frame (fixed header included) and a `write(packet,
//! buffer)` that appends the encoded frame and returns its length. The four
//! acknowledgement packets and UNSUBACK only carry a packet id, so they share
//! one reader/writer pair here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    read_u16, write_remaining_length, Error, FixedHeader, Packet, PacketType,
};

pub mod connack;
pub mod connect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsubscribe;

/// Acknowledgement of a QoS 1 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

/// First acknowledgement of a QoS 2 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

/// Release of a QoS 2 exchange, sent in response to PUBREC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

/// Final acknowledgement of a QoS 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

/// Acknowledgement of an UNSUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

pub(crate) fn read_packet(
    packet_type: PacketType,
    fixed_header: FixedHeader,
    frame: Bytes,
) -> Result<Packet, Error> {
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(connect::read(fixed_header, frame)?),
        PacketType::ConnAck => Packet::ConnAck(connack::read(fixed_header, frame)?),
        PacketType::Publish => Packet::Publish(publish::read(fixed_header, frame)?),
        PacketType::PubAck => Packet::PubAck(PubAck {
            pkid: read_pkid_only(fixed_header, frame)?,
        }),
        PacketType::PubRec => Packet::PubRec(PubRec {
            pkid: read_pkid_only(fixed_header, frame)?,
        }),
        PacketType::PubRel => Packet::PubRel(PubRel {
            pkid: read_pkid_only(fixed_header, frame)?,
        }),
        PacketType::PubComp => Packet::PubComp(PubComp {
            pkid: read_pkid_only(fixed_header, frame)?,
        }),
        PacketType::Subscribe => Packet::Subscribe(subscribe::read(fixed_header, frame)?),
        PacketType::SubAck => Packet::SubAck(suback::read(fixed_header, frame)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(unsubscribe::read(fixed_header, frame)?),
        PacketType::UnsubAck => Packet::UnsubAck(UnsubAck {
            pkid: read_pkid_only(fixed_header, frame)?,
        }),
        PacketType::PingReq => {
            read_empty(fixed_header)?;
            Packet::PingReq
        }
        PacketType::PingResp => {
            read_empty(fixed_header)?;
            Packet::PingResp
        }
        PacketType::Disconnect => {
            read_empty(fixed_header)?;
            Packet::Disconnect
        }
    };

    Ok(packet)
}

pub(crate) fn write_packet(packet: &Packet, buffer: &mut BytesMut) -> Result<usize, Error> {
    match packet {
        Packet::Connect(connect) => connect::write(connect, buffer),
        Packet::ConnAck(connack) => connack::write(connack, buffer),
        Packet::Publish(publish) => publish::write(publish, buffer),
        Packet::PubAck(puback) => write_pkid_only(0x40, puback.pkid, buffer),
        Packet::PubRec(pubrec) => write_pkid_only(0x50, pubrec.pkid, buffer),
        // PUBREL carries the mandatory 0b0010 flag nibble.
        Packet::PubRel(pubrel) => write_pkid_only(0x62, pubrel.pkid, buffer),
        Packet::PubComp(pubcomp) => write_pkid_only(0x70, pubcomp.pkid, buffer),
        Packet::Subscribe(subscribe) => subscribe::write(subscribe, buffer),
        Packet::SubAck(suback) => suback::write(suback, buffer),
        Packet::Unsubscribe(unsubscribe) => unsubscribe::write(unsubscribe, buffer),
        Packet::UnsubAck(unsuback) => write_pkid_only(0xB0, unsuback.pkid, buffer),
        Packet::PingReq => write_empty(0xC0, buffer),
        Packet::PingResp => write_empty(0xD0, buffer),
        Packet::Disconnect => write_empty(0xE0, buffer),
    }
}

/// Read a packet whose remaining length is exactly a two-byte packet id.
fn read_pkid_only(fixed_header: FixedHeader, mut frame: Bytes) -> Result<u16, Error> {
    if fixed_header.remaining_len() != 2 {
        return Err(Error::MalformedPacket);
    }

    frame.advance(fixed_header.fixed_header_len());
    read_u16(&mut frame)
}

fn write_pkid_only(byte1: u8, pkid: u16, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(byte1);
    buffer.put_u8(0x02);
    buffer.put_u16(pkid);
    Ok(4)
}

fn read_empty(fixed_header: FixedHeader) -> Result<(), Error> {
    if fixed_header.remaining_len() != 0 {
        return Err(Error::MalformedPacket);
    }

    Ok(())
}

fn write_empty(byte1: u8, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(byte1);
    buffer.put_u8(0x00);
    Ok(2)
}

/// Shared by SUBSCRIBE/SUBACK/UNSUBSCRIBE writers: fixed header plus length.
pub(crate) fn write_header(
    byte1: u8,
    remaining_len: usize,
    buffer: &mut BytesMut,
) -> Result<usize, Error> {
    buffer.reserve(1 + 4 + remaining_len);
    buffer.put_u8(byte1);
    let len_len = write_remaining_length(buffer, remaining_len)?;
    Ok(1 + len_len + remaining_len)
}
