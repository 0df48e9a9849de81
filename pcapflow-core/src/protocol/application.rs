//! Application-layer sniffers for SIP, Diameter and GTP.
//!
//! These decoders only recognise their protocol and hand the message over
//! whole as an [`ApplicationPacket`]. Grammar-level parsing belongs to
//! plug-ins registered on top.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// Three-byte prefixes of a SIP status line or request method.
const SIP_PREFIXES: [&[u8; 3]; 15] = [
    b"SIP", // Status line
    b"INV", b"ACK", b"BYE", b"OPT", b"CAN", b"MES", b"REG", b"INF", b"PRA", b"SUB", b"NOT",
    b"UPD", b"REF", b"PUB",
];

fn could_be_sip(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && SIP_PREFIXES.iter().any(|prefix| bytes.starts_with(*prefix))
}

/// Diameter header: version 1, a 24-bit length covering exactly this
/// message, and the reserved command flag bits clear.
fn could_be_diameter(bytes: &[u8]) -> bool {
    if bytes.len() < 20 || bytes[0] != 1 {
        return false;
    }
    let length = usize::from(bytes[1]) << 16 | usize::from(bytes[2]) << 8 | usize::from(bytes[3]);
    length >= 20 && length % 4 == 0 && bytes[4] & 0x0f == 0 && length == bytes.len()
}

/// GTPv1 (with the GTP protocol-type bit) or GTPv2, with a length field
/// matching the datagram.
fn could_be_gtp(bytes: &[u8]) -> bool {
    if bytes.len() < 8 {
        return false;
    }
    let length = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    match bytes[0] >> 5 {
        1 => bytes[0] & 0x10 != 0 && length + 8 == bytes.len(),
        2 => length + 4 == bytes.len(),
        _ => false,
    }
}

/// Sniffing decoder that claims a whole application message.
#[derive(Clone, Copy)]
pub struct ApplicationDecoder {
    protocol: Protocol,
    sniff: fn(&[u8]) -> bool,
}

impl ApplicationDecoder {
    pub fn sip() -> Self {
        ApplicationDecoder {
            protocol: Protocol::Sip,
            sniff: could_be_sip,
        }
    }

    pub fn diameter() -> Self {
        ApplicationDecoder {
            protocol: Protocol::Diameter,
            sniff: could_be_diameter,
        }
    }

    pub fn gtp() -> Self {
        ApplicationDecoder {
            protocol: Protocol::Gtp,
            sniff: could_be_gtp,
        }
    }
}

impl fmt::Debug for ApplicationDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApplicationDecoder")
            .field(&self.protocol)
            .finish()
    }
}

impl Decoder for ApplicationDecoder {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        buffer.with_readable_bytes(self.sniff)
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if !buffer.has_readable_bytes() {
            return Err(DecodeError::truncated(self.protocol, buffer, 1));
        }
        let message = buffer
            .read_bytes(buffer.readable_bytes())
            .in_protocol(self.protocol, buffer)?;
        Ok(Framed::new(message, Buffer::empty(), NextLayer::End))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        Ok(Arc::new(ApplicationPacket::new(self.protocol, frame.header())))
    }
}

/// An application message the core recognises but does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPacket {
    protocol: Protocol,
    content: Buffer,
}

impl ApplicationPacket {
    pub fn new(protocol: Protocol, content: Buffer) -> Self {
        ApplicationPacket { protocol, content }
    }

    /// The whole message, shared with the capture record.
    pub fn content(&self) -> &Buffer {
        &self.content
    }

    /// First line of a text protocol message, without its terminator.
    pub fn first_line(&self) -> Option<Buffer> {
        self.content.share().read_line()
    }
}

impl ProtocolPacket for ApplicationPacket {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::default_registry;
    use crate::protocol::test_utils::{Ipv4Builder, TcpBuilder, UdpBuilder};

    fn over_udp(message: &[u8]) -> Frame {
        let bytes = Ipv4Builder::new()
            .udp()
            .payload(UdpBuilder::new().payload(message.to_vec()).build())
            .build();
        Frame::decode(&default_registry(), Protocol::Ipv4, Buffer::from(bytes))
            .unwrap()
            .unwrap()
    }

    fn diameter_message() -> Vec<u8> {
        let mut data = Vec::new();
        data.push(0x01); // Version
        data.extend_from_slice(&[0x00, 0x00, 0x14]); // Length: 20
        data.push(0x80); // Flags: request
        data.extend_from_slice(&[0x00, 0x01, 0x18]); // Command code 280 (DWR)
        data.extend_from_slice(&[0x00; 4]); // Application id
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]); // Hop-by-hop id
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]); // End-to-end id
        data
    }

    #[test]
    fn test_sip_request_over_udp() {
        let ip = over_udp(b"INVITE sip:bob@example.com SIP/2.0\r\nVia: x\r\n\r\n");
        assert_eq!(
            ip.protocols().unwrap().as_slice(),
            &[Protocol::Ipv4, Protocol::Udp, Protocol::Sip]
        );
        let sip = ip.find_frame(Protocol::Sip).unwrap().unwrap().parse().unwrap();
        let app = sip.view::<ApplicationPacket>().unwrap();
        assert_eq!(
            app.first_line().unwrap().to_string(),
            "INVITE sip:bob@example.com SIP/2.0"
        );
        assert!(sip.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_sip_response_over_tcp() {
        let bytes = Ipv4Builder::new()
            .payload(
                TcpBuilder::new()
                    .flags(0x18)
                    .payload(b"SIP/2.0 200 OK\r\n\r\n".to_vec())
                    .build(),
            )
            .build();
        let ip = Frame::decode(&default_registry(), Protocol::Ipv4, Buffer::from(bytes))
            .unwrap()
            .unwrap();
        assert!(ip.has_protocol(Protocol::Sip).unwrap());
    }

    #[test]
    fn test_diameter_detection() {
        let ip = over_udp(&diameter_message());
        let diameter = ip.find_frame(Protocol::Diameter).unwrap().unwrap();
        assert_eq!(diameter.header().capacity(), 20);

        let mut wrong_length = diameter_message();
        wrong_length[3] = 0x18;
        assert!(!over_udp(&wrong_length).has_protocol(Protocol::Diameter).unwrap());

        let mut reserved_flags = diameter_message();
        reserved_flags[4] = 0x81;
        assert!(!could_be_diameter(&reserved_flags));
    }

    #[test]
    fn test_gtp_detection() {
        // GTPv1-U G-PDU carrying four bytes
        let v1 = [0x30, 0xff, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0xde, 0xad, 0xbe, 0xef];
        assert!(could_be_gtp(&v1));
        assert!(over_udp(&v1).has_protocol(Protocol::Gtp).unwrap());

        // GTPv2-C echo request without TEID
        let v2 = [0x40, 0x01, 0x00, 0x04, 0x00, 0x00, 0x01, 0x00];
        assert!(could_be_gtp(&v2));

        let mut prime = v1;
        prime[0] = 0x20; // GTP' (PT bit clear)
        assert!(!could_be_gtp(&prime));
    }

    #[test]
    fn test_unknown_payload_ends_chain() {
        let ip = over_udp(b"\x00\x01garbage");
        assert_eq!(
            ip.protocols().unwrap().as_slice(),
            &[Protocol::Ipv4, Protocol::Udp]
        );
    }
}
