//! RTP decoder.
//!
//! RTP has no well-known port, so detection is a heuristic on the fixed
//! header. It runs after every other application decoder.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// Fixed RTP header size.
const FIXED_HEADER_LEN: usize = 12;

/// Decoder for RTP packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpDecoder;

impl Decoder for RtpDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Rtp
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        if buffer.readable_bytes() < FIXED_HEADER_LEN {
            return false;
        }
        let at = buffer.reader_index();
        match (buffer.get_u8(at), buffer.get_u8(at + 1)) {
            // Payload types 72..=76 collide with RTCP packet types 200..=204
            (Ok(first), Ok(second)) => first >> 6 == 2 && !(72..=76).contains(&(second & 0x7f)),
            _ => false,
        }
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < FIXED_HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Rtp, buffer, FIXED_HEADER_LEN));
        }
        let at = buffer.reader_index();
        let first = buffer.get_u8(at).in_protocol(Protocol::Rtp, buffer)?;
        let mut header_len = FIXED_HEADER_LEN + usize::from(first & 0x0f) * 4;
        if first & 0x10 != 0 {
            // Extension: 16-bit profile id, 16-bit length in 32-bit words
            let words = buffer
                .get_u16(at + header_len + 2)
                .in_protocol(Protocol::Rtp, buffer)?;
            header_len += 4 + usize::from(words) * 4;
        }
        if buffer.readable_bytes() < header_len {
            return Err(DecodeError::truncated(Protocol::Rtp, buffer, header_len));
        }

        let header = buffer.read_bytes(header_len).in_protocol(Protocol::Rtp, buffer)?;
        Ok(Framed::new(header, buffer.slice_readable(), NextLayer::End))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let first = header.get_u8(0).in_protocol(Protocol::Rtp, &header)?;
        let second = header.get_u8(1).in_protocol(Protocol::Rtp, &header)?;

        let csrc_count = usize::from(first & 0x0f);
        let csrcs = (0..csrc_count)
            .map(|i| header.get_u32(FIXED_HEADER_LEN + i * 4))
            .collect::<Result<SmallVec<[u32; 4]>, _>>()
            .in_protocol(Protocol::Rtp, &header)?;

        Ok(Arc::new(RtpPacket {
            version: first >> 6,
            padding: first & 0x20 != 0,
            extension: first & 0x10 != 0,
            marker: second & 0x80 != 0,
            payload_type: second & 0x7f,
            sequence_number: header.get_u16(2).in_protocol(Protocol::Rtp, &header)?,
            timestamp: header.get_u32(4).in_protocol(Protocol::Rtp, &header)?,
            ssrc: header.get_u32(8).in_protocol(Protocol::Rtp, &header)?,
            csrcs,
        }))
    }
}

/// Parsed RTP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    version: u8,
    padding: bool,
    extension: bool,
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    csrcs: SmallVec<[u32; 4]>,
}

impl RtpPacket {
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn has_padding(&self) -> bool {
        self.padding
    }

    pub fn has_extension(&self) -> bool {
        self.extension
    }

    pub fn has_marker(&self) -> bool {
        self.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn csrc_count(&self) -> usize {
        self.csrcs.len()
    }

    pub fn csrcs(&self) -> &[u32] {
        &self.csrcs
    }
}

impl ProtocolPacket for RtpPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Rtp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
