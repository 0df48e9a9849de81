//! Linux "cooked" capture (SLL) decoder, link type 113.

use std::any::Any;
use std::sync::Arc;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// SLL header size.
const HEADER_LEN: usize = 16;

/// Decoder for Linux cooked capture headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SllDecoder;

impl Decoder for SllDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Sll
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        let at = buffer.reader_index();
        // Packet types 0..=4 are the only ones the kernel emits
        buffer.readable_bytes() >= HEADER_LEN
            && matches!(buffer.get_u16(at), Ok(kind) if kind <= 4)
            && matches!(buffer.get_u16(at + 4), Ok(len) if len <= 8)
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Sll, buffer, HEADER_LEN));
        }
        let header = buffer.read_bytes(HEADER_LEN).in_protocol(Protocol::Sll, buffer)?;
        let protocol = header.get_u16(14).in_protocol(Protocol::Sll, &header)?;
        let next = Protocol::from_ethertype(protocol)
            .map(NextLayer::Protocol)
            .unwrap_or(NextLayer::End);
        Ok(Framed::new(header, buffer.slice_readable(), next))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let read = |index| header.get_u16(index).in_protocol(Protocol::Sll, &header);

        let address_len = (read(4)? as usize).min(8);
        let address = header
            .slice(6, 6 + address_len)
            .in_protocol(Protocol::Sll, &header)?
            .to_vec();

        Ok(Arc::new(SllPacket {
            packet_type: read(0)?,
            hardware_type: read(2)?,
            address,
            protocol: read(14)?,
        }))
    }
}

/// Parsed SLL header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SllPacket {
    packet_type: u16,
    hardware_type: u16,
    address: Vec<u8>,
    protocol: u16,
}

impl SllPacket {
    /// 0 = to us, 1 = broadcast, 2 = multicast, 3 = other host, 4 = outgoing.
    pub fn packet_type(&self) -> u16 {
        self.packet_type
    }

    /// ARPHRD_ type of the interface.
    pub fn hardware_type(&self) -> u16 {
        self.hardware_type
    }

    /// Link-layer source address (at most 8 bytes).
    pub fn address(&self) -> &[u8] {
        &self.address
    }

    /// EtherType of the payload.
    pub fn protocol(&self) -> u16 {
        self.protocol
    }
}

impl ProtocolPacket for SllPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Sll
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
