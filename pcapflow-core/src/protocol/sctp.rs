//! SCTP decoder.
//!
//! The 12-byte common header is the frame header; the chunks that follow are
//! listed when the packet is parsed. Chunk contents (DATA user messages aside)
//! are left to plug-ins.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// SCTP common header size.
const HEADER_LEN: usize = 12;
/// Chunk type, flags and length.
const CHUNK_HEADER_LEN: usize = 4;
/// Chunk type of a DATA chunk.
pub const CHUNK_DATA: u8 = 0;

/// Decoder for SCTP packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SctpDecoder;

impl Decoder for SctpDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Sctp
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        buffer.readable_bytes() >= HEADER_LEN
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Sctp, buffer, HEADER_LEN));
        }
        let header = buffer.read_bytes(HEADER_LEN).in_protocol(Protocol::Sctp, buffer)?;
        Ok(Framed::new(header, buffer.slice_readable(), NextLayer::End))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let read_u16 = |index| header.get_u16(index).in_protocol(Protocol::Sctp, &header);

        let mut chunks = SmallVec::new();
        let mut body = frame.payload();
        while body.has_readable_bytes() {
            chunks.push(read_chunk(&mut body)?);
        }

        Ok(Arc::new(SctpPacket {
            source_port: read_u16(0)?,
            destination_port: read_u16(2)?,
            verification_tag: header.get_u32(4).in_protocol(Protocol::Sctp, &header)?,
            checksum: header.get_u32(8).in_protocol(Protocol::Sctp, &header)?,
            chunks,
        }))
    }
}

/// Reads one chunk and its padding from `body`.
fn read_chunk(body: &mut Buffer) -> Result<SctpChunk, DecodeError> {
    if body.readable_bytes() < CHUNK_HEADER_LEN {
        return Err(DecodeError::truncated(Protocol::Sctp, body, CHUNK_HEADER_LEN));
    }
    let at = body.reader_index();
    let length = usize::from(body.get_u16(at + 2).in_protocol(Protocol::Sctp, body)?);
    if length < CHUNK_HEADER_LEN {
        return Err(DecodeError::invalid(
            Protocol::Sctp,
            body,
            "chunk_length",
            format!("chunk length {length} shorter than its header"),
        ));
    }
    let value_len = length - CHUNK_HEADER_LEN;
    let padding = (4 - length % 4) % 4;
    // The last chunk may legally omit its padding
    let available = body.readable_bytes() - CHUNK_HEADER_LEN;
    if available < value_len {
        return Err(DecodeError::truncated(Protocol::Sctp, body, length + padding));
    }

    let chunk_type = body.read_u8().in_protocol(Protocol::Sctp, body)?;
    let flags = body.read_u8().in_protocol(Protocol::Sctp, body)?;
    body.skip(2).in_protocol(Protocol::Sctp, body)?;
    let value = body.read_bytes(value_len).in_protocol(Protocol::Sctp, body)?;
    body.skip(padding.min(body.readable_bytes()))
        .in_protocol(Protocol::Sctp, body)?;

    Ok(SctpChunk {
        chunk_type,
        flags,
        length: length as u16,
        value,
    })
}

/// One chunk of an SCTP packet; `value` shares the record's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpChunk {
    chunk_type: u8,
    flags: u8,
    length: u16,
    value: Buffer,
}

impl SctpChunk {
    pub fn chunk_type(&self) -> u8 {
        self.chunk_type
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Length field: header plus value, padding excluded.
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn value(&self) -> &Buffer {
        &self.value
    }

    pub fn is_data(&self) -> bool {
        self.chunk_type == CHUNK_DATA
    }

    /// Transmission sequence number of a DATA chunk.
    pub fn tsn(&self) -> Option<u32> {
        self.data_field(|value| value.get_u32(0))
    }

    /// Stream identifier of a DATA chunk.
    pub fn stream_id(&self) -> Option<u16> {
        self.data_field(|value| value.get_u16(4))
    }

    /// Stream sequence number of a DATA chunk.
    pub fn stream_sequence(&self) -> Option<u16> {
        self.data_field(|value| value.get_u16(6))
    }

    /// Payload protocol identifier of a DATA chunk.
    pub fn payload_protocol_id(&self) -> Option<u32> {
        self.data_field(|value| value.get_u32(8))
    }

    /// User data carried by a DATA chunk.
    pub fn user_data(&self) -> Option<Buffer> {
        self.data_field(|value| value.slice(12, value.capacity()))
    }

    fn data_field<T, E>(&self, read: impl FnOnce(&Buffer) -> Result<T, E>) -> Option<T> {
        if self.is_data() {
            read(&self.value).ok()
        } else {
            None
        }
    }
}

/// Parsed SCTP common header and chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpPacket {
    source_port: u16,
    destination_port: u16,
    verification_tag: u32,
    checksum: u32,
    chunks: SmallVec<[SctpChunk; 2]>,
}

impl SctpPacket {
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn verification_tag(&self) -> u32 {
        self.verification_tag
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn chunks(&self) -> &[SctpChunk] {
        &self.chunks
    }
}

impl ProtocolPacket for SctpPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Sctp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::default_registry;
    use crate::protocol::test_utils::Ipv4Builder;

    fn sctp_packet(chunks: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&3868u16.to_be_bytes()); // Source port
        data.extend_from_slice(&3868u16.to_be_bytes()); // Destination port
        data.extend_from_slice(&0xdead_beefu32.to_be_bytes()); // Verification tag
        data.extend_from_slice(&[0x00; 4]); // Checksum
        for (kind, value) in chunks {
            data.push(*kind);
            data.push(0x03); // Flags: B + E
            data.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
            data.extend_from_slice(value);
            data.resize(data.len() + (4 - value.len() % 4) % 4, 0);
        }
        data
    }

    fn data_chunk(user: &[u8]) -> Vec<u8> {
        let mut value = Vec::new();
        value.extend_from_slice(&7u32.to_be_bytes()); // TSN
        value.extend_from_slice(&1u16.to_be_bytes()); // Stream id
        value.extend_from_slice(&0u16.to_be_bytes()); // Stream sequence
        value.extend_from_slice(&46u32.to_be_bytes()); // PPID: Diameter
        value.extend_from_slice(user);
        value
    }

    fn parse(bytes: Vec<u8>) -> Packet {
        Frame::decode(
            &default_registry(),
            Protocol::Ipv4,
            Buffer::from(Ipv4Builder::new().protocol(132).payload(bytes).build()),
        )
        .unwrap()
        .unwrap()
        .find_frame(Protocol::Sctp)
        .unwrap()
        .unwrap()
        .parse()
        .unwrap()
    }

    #[test]
    fn test_chunks_listed() {
        let packet = parse(sctp_packet(&[
            (CHUNK_DATA, data_chunk(b"abc")),
            (14, vec![]), // SHUTDOWN COMPLETE
        ]));
        let sctp = packet.view::<SctpPacket>().unwrap();
        assert_eq!(sctp.source_port(), 3868);
        assert_eq!(sctp.verification_tag(), 0xdead_beef);
        assert_eq!(sctp.chunks().len(), 2);

        let data = &sctp.chunks()[0];
        assert!(data.is_data());
        assert_eq!(data.length(), 4 + 12 + 3);
        assert_eq!(data.tsn(), Some(7));
        assert_eq!(data.stream_id(), Some(1));
        assert_eq!(data.payload_protocol_id(), Some(46));
        assert_eq!(data.user_data().unwrap().to_vec(), b"abc");

        let shutdown = &sctp.chunks()[1];
        assert_eq!(shutdown.chunk_type(), 14);
        assert_eq!(shutdown.tsn(), None);
    }

    #[test]
    fn test_chunk_past_end() {
        let mut bytes = sctp_packet(&[(CHUNK_DATA, data_chunk(b"abcdef"))]);
        bytes.truncate(bytes.len() - 6);
        let frame = Frame::decode(
            &default_registry(),
            Protocol::Ipv4,
            Buffer::from(Ipv4Builder::new().protocol(132).payload(bytes).build()),
        )
        .unwrap()
        .unwrap()
        .find_frame(Protocol::Sctp)
        .unwrap()
        .unwrap();
        let err = frame.parse().unwrap_err();
        assert_eq!(err.protocol(), Protocol::Sctp);
        assert_eq!(err.offset(), 32);
    }
}
