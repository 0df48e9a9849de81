//! IPv4 decoder.

use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::Arc;

use etherparse::Ipv4HeaderSlice;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// Minimum IPv4 header size (IHL = 5).
const MIN_HEADER_LEN: usize = 20;

/// Decoder for IPv4 headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4Decoder;

impl Decoder for Ipv4Decoder {
    fn protocol(&self) -> Protocol {
        Protocol::Ipv4
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        match buffer.get_u8(buffer.reader_index()) {
            Ok(b) => {
                let ihl = usize::from(b & 0x0f);
                b >> 4 == 4 && ihl >= 5 && buffer.readable_bytes() >= ihl * 4
            }
            Err(_) => false,
        }
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < MIN_HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Ipv4, buffer, MIN_HEADER_LEN));
        }

        let at = buffer.reader_index();
        let version_ihl = buffer.get_u8(at).in_protocol(Protocol::Ipv4, buffer)?;
        if version_ihl >> 4 != 4 {
            return Err(DecodeError::invalid(
                Protocol::Ipv4,
                buffer,
                "version",
                format!("expected 4, found {}", version_ihl >> 4),
            ));
        }
        let header_len = usize::from(version_ihl & 0x0f) * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(DecodeError::invalid(
                Protocol::Ipv4,
                buffer,
                "ihl",
                format!("header length {header_len} below 20"),
            ));
        }
        if buffer.readable_bytes() < header_len {
            return Err(DecodeError::truncated(Protocol::Ipv4, buffer, header_len));
        }

        let total_length = usize::from(buffer.get_u16(at + 2).in_protocol(Protocol::Ipv4, buffer)?);
        if total_length < header_len {
            return Err(DecodeError::invalid(
                Protocol::Ipv4,
                buffer,
                "total_length",
                format!("total length {total_length} shorter than header {header_len}"),
            ));
        }
        let fragment = buffer.get_u16(at + 6).in_protocol(Protocol::Ipv4, buffer)?;
        let ip_protocol = buffer.get_u8(at + 9).in_protocol(Protocol::Ipv4, buffer)?;

        let header = buffer.read_bytes(header_len).in_protocol(Protocol::Ipv4, buffer)?;
        // Anything past the total length (link padding) is not ours to hand on
        let payload_len = (total_length - header_len).min(buffer.readable_bytes());
        let payload = buffer.read_bytes(payload_len).in_protocol(Protocol::Ipv4, buffer)?;
        let trailer = buffer.slice_readable();

        // Only the first fragment starts with a transport header
        let next = if fragment & 0x1fff != 0 {
            NextLayer::End
        } else {
            Protocol::from_ip_number(ip_protocol)
                .map(NextLayer::Protocol)
                .unwrap_or(NextLayer::End)
        };

        Ok(Framed::new(header, payload, next).with_trailer(trailer))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let parsed = header.with_bytes(|bytes| {
            let checksum_valid = header_checksum(bytes) == 0;
            Ipv4HeaderSlice::from_slice(bytes)
                .map(|ip| Ipv4Packet {
                    header_length: ip.slice().len(),
                    dscp: ip.dcp().value(),
                    ecn: ip.ecn().value(),
                    total_length: ip.total_len(),
                    identification: ip.identification(),
                    dont_fragment: ip.dont_fragment(),
                    more_fragments: ip.more_fragments(),
                    fragment_offset: ip.fragments_offset().value(),
                    ttl: ip.ttl(),
                    protocol: ip.protocol().0,
                    checksum: ip.header_checksum(),
                    checksum_valid,
                    source: Ipv4Addr::from(ip.source()),
                    destination: Ipv4Addr::from(ip.destination()),
                })
                .map_err(|e| e.to_string())
        });
        let packet =
            parsed.map_err(|reason| DecodeError::invalid(Protocol::Ipv4, &header, "header", reason))?;
        Ok(Arc::new(packet))
    }
}

/// Ones' complement sum over `bytes`; 0 for a header with a correct checksum.
fn header_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in bytes.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Parsed IPv4 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    header_length: usize,
    dscp: u8,
    ecn: u8,
    total_length: u16,
    identification: u16,
    dont_fragment: bool,
    more_fragments: bool,
    fragment_offset: u16,
    ttl: u8,
    protocol: u8,
    checksum: u16,
    checksum_valid: bool,
    source: Ipv4Addr,
    destination: Ipv4Addr,
}

impl Ipv4Packet {
    pub fn header_length(&self) -> usize {
        self.header_length
    }

    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    pub fn ecn(&self) -> u8 {
        self.ecn
    }

    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    pub fn identification(&self) -> u16 {
        self.identification
    }

    pub fn dont_fragment(&self) -> bool {
        self.dont_fragment
    }

    pub fn more_fragments(&self) -> bool {
        self.more_fragments
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.fragment_offset
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// IP protocol number of the payload.
    pub fn ip_protocol(&self) -> u8 {
        self.protocol
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Whether the captured header checksum verifies.
    pub fn checksum_valid(&self) -> bool {
        self.checksum_valid
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }
}

impl ProtocolPacket for Ipv4Packet {
    fn protocol(&self) -> Protocol {
        Protocol::Ipv4
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Rewrites total length and header checksum when the payload size changed.
    fn encapsulate(&self, frame: &Frame, payload: &Buffer) -> Result<Buffer, DecodeError> {
        let captured = frame.header();
        if payload.capacity() == frame.payload().capacity() {
            return Ok(Buffer::concat(&[&captured, payload, &frame.trailer()]));
        }

        let total = captured.capacity() + payload.capacity();
        let total = u16::try_from(total).map_err(|_| {
            DecodeError::invalid(
                Protocol::Ipv4,
                &captured,
                "total_length",
                format!("{total} bytes do not fit a 16-bit length"),
            )
        })?;
        let header = captured.clone();
        header.set_u16(2, total).in_protocol(Protocol::Ipv4, &captured)?;
        header.set_u16(10, 0).in_protocol(Protocol::Ipv4, &captured)?;
        let checksum = header.with_bytes(header_checksum);
        header.set_u16(10, checksum).in_protocol(Protocol::Ipv4, &captured)?;
        Ok(Buffer::concat(&[&header, payload, &frame.trailer()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::default_registry;
    use crate::protocol::test_utils::{EthernetBuilder, Ipv4Builder, TcpBuilder};

    fn decode_ip(bytes: Vec<u8>) -> Frame {
        Frame::decode(&default_registry(), Protocol::Ipv4, Buffer::from(bytes))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_ipv4_fields() {
        let ip = decode_ip(
            Ipv4Builder::new()
                .src_ip([10, 0, 0, 1])
                .dst_ip([10, 0, 0, 2])
                .payload(TcpBuilder::new().build())
                .build(),
        );
        let packet = ip.parse().unwrap();
        let view = packet.view::<Ipv4Packet>().unwrap();
        assert_eq!(view.source(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(view.destination(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(view.ttl(), 64);
        assert_eq!(view.ip_protocol(), 6);
        assert_eq!(view.total_length(), 40);
        assert!(view.dont_fragment());
        assert!(!view.is_fragment());
        assert!(view.checksum_valid());
        assert_eq!(ip.next_layer(), NextLayer::Protocol(Protocol::Tcp));
    }

    #[test]
    fn test_payload_trimmed_to_total_length() {
        let mut bytes = Ipv4Builder::new().payload(TcpBuilder::new().build()).build();
        bytes.extend_from_slice(&[0u8; 6]); // Ethernet minimum-size padding
        let ip = decode_ip(bytes);
        assert_eq!(ip.payload().capacity(), 20);
        assert_eq!(ip.trailer().capacity(), 6);
    }

    #[test]
    fn test_non_first_fragment_ends_chain() {
        let ip = decode_ip(
            Ipv4Builder::new()
                .fragment_offset(185)
                .payload(vec![0xab; 24])
                .build(),
        );
        assert_eq!(ip.next_layer(), NextLayer::End);
        assert!(ip.next_frame().unwrap().is_none());
        let packet = ip.parse().unwrap();
        assert!(packet.view::<Ipv4Packet>().unwrap().is_fragment());
    }

    #[test]
    fn test_invalid_version() {
        let mut bytes = Ipv4Builder::new().build();
        bytes[0] = 0x65;
        let err = Frame::decode(&default_registry(), Protocol::Ipv4, Buffer::from(bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "version", .. }));
    }

    #[test]
    fn test_total_length_below_header() {
        let mut bytes = Ipv4Builder::new().build();
        bytes[2..4].copy_from_slice(&12u16.to_be_bytes());
        let err = Frame::decode(&default_registry(), Protocol::Ipv4, Buffer::from(bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "total_length", .. }));
    }

    #[test]
    fn test_resized_payload_fixes_length_and_checksum() {
        let bytes = EthernetBuilder::new()
            .payload(Ipv4Builder::new().payload(TcpBuilder::new().build()).build())
            .build();
        let eth = Frame::decode(&default_registry(), Protocol::Ethernet, Buffer::from(bytes))
            .unwrap()
            .unwrap();
        let tcp = eth.find_frame(Protocol::Tcp).unwrap().unwrap().parse().unwrap();

        let bigger = Buffer::from(vec![0u8; 4]);
        let out = tcp.encapsulated(Some(&bigger)).unwrap().to_vec();
        let ip_header = &out[14..34];
        assert_eq!(u16::from_be_bytes([ip_header[2], ip_header[3]]), 20 + 20 + 4);
        assert_eq!(header_checksum(ip_header), 0);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let ip = decode_ip(Ipv4Builder::new().payload(TcpBuilder::new().build()).build());
        let tcp = ip.find_frame(Protocol::Tcp).unwrap().unwrap().parse().unwrap();

        let err = tcp
            .encapsulated(Some(&Buffer::zeroed(70_000)))
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidField {
                protocol: Protocol::Ipv4,
                field: "total_length",
                ..
            }
        ));
    }
}
