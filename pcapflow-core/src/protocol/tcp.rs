//! TCP decoder.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use etherparse::TcpHeaderSlice;

use super::{Framed, Layer, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::Decoder;

/// Minimum TCP header size (data offset = 5).
const MIN_HEADER_LEN: usize = 20;

/// Decoder for TCP segments.
///
/// The payload is handed to application-layer detection; TCP itself never
/// names what it carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDecoder;

impl Decoder for TcpDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        let at = buffer.reader_index();
        match buffer.get_u8(at + 12) {
            Ok(b) => {
                let len = usize::from(b >> 4) * 4;
                len >= MIN_HEADER_LEN && buffer.readable_bytes() >= len
            }
            Err(_) => false,
        }
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < MIN_HEADER_LEN {
            return Err(DecodeError::truncated(Protocol::Tcp, buffer, MIN_HEADER_LEN));
        }
        let at = buffer.reader_index();
        let data_offset = buffer.get_u8(at + 12).in_protocol(Protocol::Tcp, buffer)? >> 4;
        let header_len = usize::from(data_offset) * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(DecodeError::invalid(
                Protocol::Tcp,
                buffer,
                "data_offset",
                format!("data offset {data_offset} below 5"),
            ));
        }
        if buffer.readable_bytes() < header_len {
            return Err(DecodeError::truncated(Protocol::Tcp, buffer, header_len));
        }

        let header = buffer.read_bytes(header_len).in_protocol(Protocol::Tcp, buffer)?;
        Ok(Framed::new(
            header,
            buffer.slice_readable(),
            NextLayer::Layer(Layer::Application),
        ))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let payload_length = frame.payload().capacity();
        let parsed = header.with_bytes(|bytes| {
            TcpHeaderSlice::from_slice(bytes)
                .map(|tcp| TcpPacket {
                    source_port: tcp.source_port(),
                    destination_port: tcp.destination_port(),
                    sequence_number: tcp.sequence_number(),
                    acknowledgment_number: tcp.acknowledgment_number(),
                    header_length: usize::from(tcp.data_offset()) * 4,
                    flags: TcpFlags {
                        fin: tcp.fin(),
                        syn: tcp.syn(),
                        rst: tcp.rst(),
                        psh: tcp.psh(),
                        ack: tcp.ack(),
                        urg: tcp.urg(),
                        ece: tcp.ece(),
                        cwr: tcp.cwr(),
                        ns: tcp.ns(),
                    },
                    window_size: tcp.window_size(),
                    checksum: tcp.checksum(),
                    urgent_pointer: tcp.urgent_pointer(),
                    options: Bytes::copy_from_slice(&bytes[MIN_HEADER_LEN..tcp.slice().len()]),
                    payload_length,
                })
                .map_err(|e| e.to_string())
        });
        let packet =
            parsed.map_err(|reason| DecodeError::invalid(Protocol::Tcp, &header, "header", reason))?;
        Ok(Arc::new(packet))
    }
}

/// TCP control bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

/// Parsed TCP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    source_port: u16,
    destination_port: u16,
    sequence_number: u32,
    acknowledgment_number: u32,
    header_length: usize,
    flags: TcpFlags,
    window_size: u16,
    checksum: u16,
    urgent_pointer: u16,
    options: Bytes,
    payload_length: usize,
}

impl TcpPacket {
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn acknowledgment_number(&self) -> u32 {
        self.acknowledgment_number
    }

    /// Header length in bytes, options included.
    pub fn header_length(&self) -> usize {
        self.header_length
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub fn is_syn(&self) -> bool {
        self.flags.syn
    }

    pub fn is_fin(&self) -> bool {
        self.flags.fin
    }

    pub fn is_rst(&self) -> bool {
        self.flags.rst
    }

    pub fn is_ack(&self) -> bool {
        self.flags.ack
    }

    pub fn is_psh(&self) -> bool {
        self.flags.psh
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Raw option bytes between the fixed header and the payload.
    pub fn options(&self) -> &Bytes {
        &self.options
    }

    /// Bytes of segment data as captured.
    pub fn payload_length(&self) -> usize {
        self.payload_length
    }
}

impl ProtocolPacket for TcpPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
