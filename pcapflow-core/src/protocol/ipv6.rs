//! IPv6 decoder, including the extension header chain.

use std::any::Any;
use std::net::Ipv6Addr;
use std::sync::Arc;

use etherparse::Ipv6HeaderSlice;
use smallvec::SmallVec;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// Fixed IPv6 header size.
const HEADER_LEN: usize = 40;

/// Extension header numbers.
mod next_header {
    pub const HOP_BY_HOP: u8 = 0;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const AUTH: u8 = 51;
    pub const DEST_OPTS: u8 = 60;
}

fn is_extension(kind: u8) -> bool {
    matches!(
        kind,
        next_header::HOP_BY_HOP
            | next_header::ROUTING
            | next_header::FRAGMENT
            | next_header::AUTH
            | next_header::DEST_OPTS
    )
}

/// Result of walking the extension headers after the fixed header.
struct ExtensionChain {
    kinds: SmallVec<[u8; 4]>,
    length: usize,
    upper_protocol: u8,
    fragment_offset: u16,
    more_fragments: bool,
}

/// Walks extension headers in `bytes` (everything after the fixed header).
fn walk_extensions(first: u8, bytes: &[u8]) -> Result<ExtensionChain, (usize, &'static str)> {
    let mut chain = ExtensionChain {
        kinds: SmallVec::new(),
        length: 0,
        upper_protocol: first,
        fragment_offset: 0,
        more_fragments: false,
    };

    while is_extension(chain.upper_protocol) {
        let rest = &bytes[chain.length..];
        if rest.len() < 8 {
            return Err((chain.length, "extension header"));
        }
        let len = match chain.upper_protocol {
            next_header::FRAGMENT => {
                let field = u16::from_be_bytes([rest[2], rest[3]]);
                chain.fragment_offset = field >> 3;
                chain.more_fragments = field & 0x1 != 0;
                8
            }
            next_header::AUTH => (usize::from(rest[1]) + 2) * 4,
            _ => (usize::from(rest[1]) + 1) * 8,
        };
        if rest.len() < len {
            return Err((chain.length, "extension header length"));
        }
        chain.kinds.push(chain.upper_protocol);
        chain.upper_protocol = rest[0];
        chain.length += len;
    }

    Ok(chain)
}

/// Decoder for IPv6 headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6Decoder;

impl Decoder for Ipv6Decoder {
    fn protocol(&self) -> Protocol {
        Protocol::Ipv6
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        buffer.readable_bytes() >= HEADER_LEN
            && matches!(buffer.get_u8(buffer.reader_index()), Ok(b) if b >> 4 == 6)
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Ipv6, buffer, HEADER_LEN));
        }
        let at = buffer.reader_index();
        let version = buffer.get_u8(at).in_protocol(Protocol::Ipv6, buffer)? >> 4;
        if version != 6 {
            return Err(DecodeError::invalid(
                Protocol::Ipv6,
                buffer,
                "version",
                format!("expected 6, found {version}"),
            ));
        }
        let payload_length = usize::from(buffer.get_u16(at + 4).in_protocol(Protocol::Ipv6, buffer)?);
        let first = buffer.get_u8(at + 6).in_protocol(Protocol::Ipv6, buffer)?;

        let chain = buffer
            .with_readable_bytes(|bytes| walk_extensions(first, &bytes[HEADER_LEN..]))
            .map_err(|(offset, field)| DecodeError::InvalidField {
                protocol: Protocol::Ipv6,
                offset: buffer.record_offset() + HEADER_LEN + offset,
                field,
                reason: "extension header runs past the packet".into(),
            })?;

        let header_len = HEADER_LEN + chain.length;
        let header = buffer.read_bytes(header_len).in_protocol(Protocol::Ipv6, buffer)?;

        // A zero payload length is a jumbogram; take what was captured
        let payload_len = if payload_length == 0 {
            buffer.readable_bytes()
        } else {
            payload_length
                .saturating_sub(chain.length)
                .min(buffer.readable_bytes())
        };
        let payload = buffer.read_bytes(payload_len).in_protocol(Protocol::Ipv6, buffer)?;
        let trailer = buffer.slice_readable();

        let next = if chain.fragment_offset != 0 {
            NextLayer::End
        } else {
            Protocol::from_ip_number(chain.upper_protocol)
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
            let ip = Ipv6HeaderSlice::from_slice(bytes).map_err(|e| e.to_string())?;
            let chain = walk_extensions(ip.next_header().0, &bytes[HEADER_LEN..])
                .map_err(|(_, field)| format!("malformed {field}"))?;
            Ok::<_, String>(Ipv6Packet {
                traffic_class: ip.traffic_class(),
                flow_label: ip.flow_label().value(),
                payload_length: ip.payload_length(),
                hop_limit: ip.hop_limit(),
                source: Ipv6Addr::from(ip.source()),
                destination: Ipv6Addr::from(ip.destination()),
                extensions: chain.kinds,
                upper_protocol: chain.upper_protocol,
                fragment_offset: chain.fragment_offset,
                more_fragments: chain.more_fragments,
            })
        });
        let packet =
            parsed.map_err(|reason| DecodeError::invalid(Protocol::Ipv6, &header, "header", reason))?;
        Ok(Arc::new(packet))
    }
}

/// Parsed IPv6 header and extension chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    traffic_class: u8,
    flow_label: u32,
    payload_length: u16,
    hop_limit: u8,
    source: Ipv6Addr,
    destination: Ipv6Addr,
    extensions: SmallVec<[u8; 4]>,
    upper_protocol: u8,
    fragment_offset: u16,
    more_fragments: bool,
}

impl Ipv6Packet {
    pub fn traffic_class(&self) -> u8 {
        self.traffic_class
    }

    pub fn flow_label(&self) -> u32 {
        self.flow_label
    }

    pub fn payload_length(&self) -> u16 {
        self.payload_length
    }

    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    pub fn source(&self) -> Ipv6Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv6Addr {
        self.destination
    }

    /// Extension header numbers in the order they appear.
    pub fn extensions(&self) -> &[u8] {
        &self.extensions
    }

    /// Next-header value after the last extension header.
    pub fn upper_protocol(&self) -> u8 {
        self.upper_protocol
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

impl ProtocolPacket for Ipv6Packet {
    fn protocol(&self) -> Protocol {
        Protocol::Ipv6
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
