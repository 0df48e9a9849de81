//! UDP decoder.

use std::any::Any;
use std::sync::Arc;

use etherparse::UdpHeaderSlice;

use super::{Framed, Layer, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// UDP header size.
const HEADER_LEN: usize = 8;

/// Decoder for UDP datagrams.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpDecoder;

impl Decoder for UdpDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        matches!(
            buffer.get_u16(buffer.reader_index() + 4),
            Ok(len) if usize::from(len) >= HEADER_LEN
        )
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Udp, buffer, HEADER_LEN));
        }
        let length = usize::from(
            buffer
                .get_u16(buffer.reader_index() + 4)
                .in_protocol(Protocol::Udp, buffer)?,
        );
        if length < HEADER_LEN {
            return Err(DecodeError::invalid(
                Protocol::Udp,
                buffer,
                "length",
                format!("length {length} shorter than the header"),
            ));
        }

        let header = buffer.read_bytes(HEADER_LEN).in_protocol(Protocol::Udp, buffer)?;
        let payload_len = (length - HEADER_LEN).min(buffer.readable_bytes());
        let payload = buffer.read_bytes(payload_len).in_protocol(Protocol::Udp, buffer)?;
        Ok(
            Framed::new(header, payload, NextLayer::Layer(Layer::Application))
                .with_trailer(buffer.slice_readable()),
        )
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let parsed = header.with_bytes(|bytes| {
            UdpHeaderSlice::from_slice(bytes)
                .map(|udp| UdpPacket {
                    source_port: udp.source_port(),
                    destination_port: udp.destination_port(),
                    length: udp.length(),
                    checksum: udp.checksum(),
                })
                .map_err(|e| e.to_string())
        });
        let packet =
            parsed.map_err(|reason| DecodeError::invalid(Protocol::Udp, &header, "header", reason))?;
        Ok(Arc::new(packet))
    }
}

/// Parsed UDP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    source_port: u16,
    destination_port: u16,
    length: u16,
    checksum: u16,
}

impl UdpPacket {
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    /// Header plus payload length, as written in the header.
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }
}

impl ProtocolPacket for UdpPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Rewrites the length field when the payload size changed.
    ///
    /// Over IPv4 the checksum is cleared as well, which marks it as unused.
    fn encapsulate(&self, frame: &Frame, payload: &Buffer) -> Result<Buffer, DecodeError> {
        let captured = frame.header();
        if payload.capacity() == frame.payload().capacity() {
            return Ok(Buffer::concat(&[&captured, payload, &frame.trailer()]));
        }

        let length = HEADER_LEN + payload.capacity();
        let length = u16::try_from(length).map_err(|_| {
            DecodeError::invalid(
                Protocol::Udp,
                &captured,
                "length",
                format!("{length} bytes do not fit a 16-bit length"),
            )
        })?;
        let header = captured.clone();
        header.set_u16(4, length).in_protocol(Protocol::Udp, &captured)?;
        if frame.parent().map(|p| p.protocol()) == Some(Protocol::Ipv4) {
            header.set_u16(6, 0).in_protocol(Protocol::Udp, &captured)?;
        }
        Ok(Buffer::concat(&[&header, payload, &frame.trailer()]))
    }
}
