//! Ethernet II decoder, with a single optional 802.1Q tag.

use std::any::Any;
use std::sync::Arc;

use etherparse::Ethernet2HeaderSlice;

use super::{ethertype, Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// Ethernet header size without a VLAN tag.
const HEADER_LEN: usize = 14;
/// Ethernet header size with one 802.1Q tag.
const TAGGED_HEADER_LEN: usize = 18;

/// Decoder for Ethernet II frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct EthernetDecoder;

impl Decoder for EthernetDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Ethernet
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        let at = buffer.reader_index();
        match buffer.get_u16(at + 12) {
            // Values below 0x0600 are 802.3 lengths, not EtherTypes
            Ok(ethertype) => ethertype >= 0x0600 && buffer.readable_bytes() >= HEADER_LEN,
            Err(_) => false,
        }
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Ethernet, buffer, HEADER_LEN));
        }

        let at = buffer.reader_index();
        let mut ether_type = buffer.get_u16(at + 12).in_protocol(Protocol::Ethernet, buffer)?;
        let header_len = if ether_type == ethertype::VLAN {
            if buffer.readable_bytes() < TAGGED_HEADER_LEN {
                return Err(DecodeError::truncated(
                    Protocol::Ethernet,
                    buffer,
                    TAGGED_HEADER_LEN,
                ));
            }
            ether_type = buffer.get_u16(at + 16).in_protocol(Protocol::Ethernet, buffer)?;
            TAGGED_HEADER_LEN
        } else {
            HEADER_LEN
        };

        let header = buffer.read_bytes(header_len).in_protocol(Protocol::Ethernet, buffer)?;
        let payload = buffer.slice_readable();
        let next = Protocol::from_ethertype(ether_type)
            .map(NextLayer::Protocol)
            .unwrap_or(NextLayer::End);

        Ok(Framed::new(header, payload, next))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let parsed = header.with_bytes(|bytes| {
            Ethernet2HeaderSlice::from_slice(bytes)
                .map(|eth| (eth.destination(), eth.source(), eth.ether_type().0))
                .map_err(|e| e.to_string())
        });
        let (destination, source, outer_type) = parsed
            .map_err(|reason| DecodeError::invalid(Protocol::Ethernet, &header, "header", reason))?;

        let (vlan_id, ether_type) = if outer_type == ethertype::VLAN {
            let tci = header.get_u16(14).in_protocol(Protocol::Ethernet, &header)?;
            let inner = header.get_u16(16).in_protocol(Protocol::Ethernet, &header)?;
            (Some(tci & 0x0fff), inner)
        } else {
            (None, outer_type)
        };

        Ok(Arc::new(EthernetPacket {
            source,
            destination,
            ether_type,
            vlan_id,
        }))
    }
}

/// Parsed Ethernet II header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetPacket {
    source: [u8; 6],
    destination: [u8; 6],
    ether_type: u16,
    vlan_id: Option<u16>,
}

impl EthernetPacket {
    pub fn source_mac(&self) -> [u8; 6] {
        self.source
    }

    pub fn destination_mac(&self) -> [u8; 6] {
        self.destination
    }

    /// EtherType of the payload (the inner one for tagged frames).
    pub fn ether_type(&self) -> u16 {
        self.ether_type
    }

    /// 802.1Q VLAN identifier, when tagged.
    pub fn vlan_id(&self) -> Option<u16> {
        self.vlan_id
    }
}

impl ProtocolPacket for EthernetPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Ethernet
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
