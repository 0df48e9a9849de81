//! The capture record itself, as the top layer of every frame chain.
//!
//! A record buffer is the 16-byte record header, in the capture's byte
//! order, followed by the captured bytes. Decode error offsets are therefore
//! relative to the start of the record header.

use std::any::Any;
use std::sync::Arc;

use super::{Framed, NextLayer, Protocol};
use crate::buffer::Buffer;
use crate::error::{BufferResultExt, DecodeError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};
use crate::pcap::{ByteOrder, PcapGlobalHeader, RecordHeader, TimestampPrecision};
use crate::protocol::Decoder;

/// Frames capture records of one capture file.
///
/// Not part of any registry: the reader builds one per file from the global
/// header and hands it to [`Frame::decode_record`].
#[derive(Debug, Clone, Copy)]
pub struct PcapDecoder {
    header: PcapGlobalHeader,
}

impl PcapDecoder {
    pub fn new(header: PcapGlobalHeader) -> Self {
        PcapDecoder { header }
    }

    pub fn global_header(&self) -> &PcapGlobalHeader {
        &self.header
    }

    fn record_header(&self, buffer: &Buffer) -> Result<RecordHeader, DecodeError> {
        let mut bytes = [0u8; RecordHeader::SIZE];
        let raw = buffer
            .slice(buffer.reader_index(), buffer.reader_index() + RecordHeader::SIZE)
            .in_protocol(Protocol::Pcap, buffer)?;
        raw.with_bytes(|b| bytes.copy_from_slice(b));
        Ok(RecordHeader::decode(&bytes, self.header.byte_order))
    }
}

impl Decoder for PcapDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Pcap
    }

    fn accept(&self, buffer: &Buffer) -> bool {
        buffer.readable_bytes() >= RecordHeader::SIZE
    }

    fn frame(&self, _parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError> {
        if buffer.readable_bytes() < RecordHeader::SIZE {
            return Err(DecodeError::truncated(Protocol::Pcap, buffer, RecordHeader::SIZE));
        }
        let record = self.record_header(buffer)?;
        record
            .validate(self.header.precision)
            .map_err(|reason| DecodeError::invalid(Protocol::Pcap, buffer, "record_header", reason))?;

        let header = buffer
            .read_bytes(RecordHeader::SIZE)
            .in_protocol(Protocol::Pcap, buffer)?;
        let captured = record.captured_length as usize;
        if buffer.readable_bytes() < captured {
            return Err(DecodeError::truncated(Protocol::Pcap, buffer, captured));
        }
        let payload = buffer.read_bytes(captured).in_protocol(Protocol::Pcap, buffer)?;
        let next = Protocol::next_for_link_type(self.header.link_type).unwrap_or(NextLayer::End);

        Ok(Framed::new(header, payload, next))
    }

    fn parse(
        &self,
        frame: &Frame,
        _parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError> {
        let header = frame.header();
        let record = self.record_header(&header)?;
        Ok(Arc::new(PcapPacket {
            global: self.header,
            record,
        }))
    }
}

/// One capture record: its timestamps and lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapPacket {
    global: PcapGlobalHeader,
    record: RecordHeader,
}

impl PcapPacket {
    pub fn global_header(&self) -> &PcapGlobalHeader {
        &self.global
    }

    pub fn record_header(&self) -> &RecordHeader {
        &self.record
    }

    pub fn ts_sec(&self) -> u32 {
        self.record.ts_sec
    }

    /// Fractional timestamp in the capture's own precision.
    pub fn ts_frac(&self) -> u32 {
        self.record.ts_frac
    }

    pub fn captured_length(&self) -> u32 {
        self.record.captured_length
    }

    pub fn original_length(&self) -> u32 {
        self.record.original_length
    }

    /// Arrival time in microseconds since the epoch, whatever the precision.
    pub fn arrival_time(&self) -> i64 {
        self.record.timestamp_us(self.global.precision)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.global.byte_order
    }

    pub fn precision(&self) -> TimestampPrecision {
        self.global.precision
    }

    pub fn link_type(&self) -> u32 {
        self.global.link_type
    }

    /// Whether the record was cut short by the snap length.
    pub fn is_truncated(&self) -> bool {
        self.record.captured_length < self.record.original_length
    }
}

impl ProtocolPacket for PcapPacket {
    fn protocol(&self) -> Protocol {
        Protocol::Pcap
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Rewrites both lengths when the payload size changed, keeping however
    /// many bytes the original capture had cut off.
    fn encapsulate(&self, frame: &Frame, payload: &Buffer) -> Result<Buffer, DecodeError> {
        if payload.capacity() == frame.payload().capacity() {
            return Ok(Buffer::concat(&[&frame.header(), payload]));
        }
        let captured = u32::try_from(payload.capacity()).map_err(|_| {
            DecodeError::invalid(
                Protocol::Pcap,
                &frame.header(),
                "captured_length",
                format!("{} bytes do not fit a record", payload.capacity()),
            )
        })?;
        let cut = self
            .record
            .original_length
            .saturating_sub(self.record.captured_length);
        let record = RecordHeader {
            captured_length: captured,
            original_length: captured.saturating_add(cut),
            ..self.record
        };
        let header = Buffer::from(record.encode(self.global.byte_order).to_vec());
        Ok(Buffer::concat(&[&header, payload]))
    }
}
