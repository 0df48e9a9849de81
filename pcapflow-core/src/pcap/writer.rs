//! Streaming capture writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::{PcapGlobalHeader, RecordHeader, TimestampPrecision};
use crate::buffer::Buffer;
use crate::error::{PcapError, Result, UsageError};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::protocol::{NextLayer, PcapPacket, Protocol};

/// Writes packets as a legacy PCAP stream.
///
/// The global header goes out with the first record. Unless one was given
/// up front, it is taken from that record: the capture header of a record
/// read from a file, or a default header for the link protocol of a record
/// built without one.
///
/// Records read from a capture in another byte order or timestamp precision
/// have their record header converted; everything else is written as is.
pub struct PcapWriter<W: Write> {
    out: W,
    header: Option<PcapGlobalHeader>,
    header_written: bool,
    records: u64,
}

impl PcapWriter<BufWriter<File>> {
    /// Create (or truncate) a capture file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> PcapWriter<W> {
    /// A writer whose global header is derived from the first record.
    pub fn new(out: W) -> Self {
        PcapWriter {
            out,
            header: None,
            header_written: false,
            records: 0,
        }
    }

    /// A writer emitting `header`, whatever the records' origin.
    pub fn with_header(out: W, header: PcapGlobalHeader) -> Self {
        PcapWriter {
            header: Some(header),
            ..Self::new(out)
        }
    }

    /// The global header, once known.
    pub fn header(&self) -> Option<&PcapGlobalHeader> {
        self.header.as_ref()
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Write the record `packet` belongs to, captured bytes unchanged.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.write_packet_with(packet, None)
    }

    /// Write the record `packet` belongs to, with `payload` in place of the
    /// packet's captured payload.
    ///
    /// Each enclosing layer adjusts the length and checksum fields it knows
    /// about.
    pub fn write_packet_with(&mut self, packet: &Packet, payload: Option<&Buffer>) -> Result<()> {
        let bytes = packet.encapsulated(payload)?;
        let root = packet.frame().root().parse()?;
        self.write_record(&root, bytes)
    }

    /// Write the record `frame` belongs to, exactly as captured.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let root = frame.root();
        let bytes = root.to_buffer();
        self.write_record(&root.parse()?, bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_record(&mut self, root: &Packet, bytes: Buffer) -> Result<()> {
        let header = self.resolve_header(root)?;
        check_link_type(&header, root)?;
        if !self.header_written {
            tracing::debug!(link_type = header.link_type, "writing capture header");
            self.out.write_all(&header.to_bytes())?;
            self.header_written = true;
        }

        match root.downcast::<PcapPacket>() {
            Some(pcap) => {
                let source = pcap.global_header();
                if source.byte_order == header.byte_order && source.precision == header.precision {
                    bytes.write_to(&mut self.out)?;
                } else {
                    let mut raw = [0u8; RecordHeader::SIZE];
                    bytes
                        .slice_to(RecordHeader::SIZE)?
                        .with_bytes(|b| raw.copy_from_slice(b));
                    let mut record = RecordHeader::decode(&raw, source.byte_order);
                    record.ts_frac = source.precision.convert(record.ts_frac, header.precision);
                    self.out.write_all(&record.encode(header.byte_order))?;
                    bytes
                        .slice(RecordHeader::SIZE, bytes.capacity())?
                        .write_to(&mut self.out)?;
                }
            }
            None => {
                let length = u32::try_from(bytes.capacity()).unwrap_or(u32::MAX);
                let mut record = RecordHeader::from_micros(root.arrival_time(), length, length);
                record.ts_frac = TimestampPrecision::Micro.convert(record.ts_frac, header.precision);
                self.out.write_all(&record.encode(header.byte_order))?;
                bytes.write_to(&mut self.out)?;
            }
        }

        self.records += 1;
        Ok(())
    }

    fn resolve_header(&mut self, root: &Packet) -> Result<PcapGlobalHeader> {
        match self.header {
            Some(header) => Ok(header),
            None => {
                let derived = match root.downcast::<PcapPacket>() {
                    Some(pcap) => *pcap.global_header(),
                    None => root
                        .protocol()
                        .link_type()
                        .map(PcapGlobalHeader::default_for)
                        .ok_or_else(|| {
                            UsageError::MissingHeader(format!(
                                "no link type for {} records; supply a global header",
                                root.protocol()
                            ))
                        })?,
                };
                self.header = Some(derived);
                Ok(derived)
            }
        }
    }
}

/// Rejects a record whose top layer cannot start a record of the capture's
/// link type. Unknown capture link types accept anything.
fn check_link_type(header: &PcapGlobalHeader, root: &Packet) -> Result<()> {
    let fits = match root.downcast::<PcapPacket>() {
        Some(pcap) => pcap.link_type() == header.link_type,
        None => match Protocol::next_for_link_type(header.link_type) {
            Some(NextLayer::Protocol(protocol)) => protocol == root.protocol(),
            Some(NextLayer::Layer(layer)) => layer == root.protocol().layer(),
            Some(NextLayer::End) | None => true,
        },
    };
    if fits {
        return Ok(());
    }
    let link_type = match root.downcast::<PcapPacket>() {
        Some(pcap) => pcap.link_type(),
        None => root.protocol().link_type().unwrap_or(0),
    };
    Err(PcapError::UnsupportedLinkType { link_type }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::{ByteOrder, PcapReader};
    use crate::protocol::test_utils::{pcap_file, EthernetBuilder, Ipv4Builder, TcpBuilder};
    use crate::protocol::{default_registry, link_type};

    fn tcp_packet(payload: &[u8]) -> Vec<u8> {
        EthernetBuilder::new()
            .payload(
                Ipv4Builder::new()
                    .payload(TcpBuilder::new().flags(0x18).payload(payload.to_vec()).build())
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let original = pcap_file(
            link_type::ETHERNET,
            &[(1, 10, tcp_packet(b"one")), (2, 20, tcp_packet(b"two"))],
        );
        let reader = PcapReader::from_reader(original.as_slice()).unwrap();

        let mut writer = PcapWriter::new(Vec::new());
        for packet in reader {
            writer.write_packet(&packet.unwrap()).unwrap();
        }
        assert_eq!(writer.records_written(), 2);
        assert_eq!(writer.into_inner().unwrap(), original);
    }

    #[test]
    fn test_write_inner_packet_writes_whole_record() {
        let original = pcap_file(link_type::ETHERNET, &[(1, 0, tcp_packet(b"data"))]);
        let mut reader = PcapReader::from_reader(original.as_slice()).unwrap();
        let root = reader.next_packet().unwrap().unwrap();
        let tcp = root.get_packet(Protocol::Tcp).unwrap().unwrap();

        let mut writer = PcapWriter::new(Vec::new());
        writer.write_packet(&tcp).unwrap();
        writer.write_frame(tcp.frame()).unwrap();

        let out = writer.into_inner().unwrap();
        let record = &original[PcapGlobalHeader::SIZE..];
        assert_eq!(&out[..PcapGlobalHeader::SIZE], &original[..PcapGlobalHeader::SIZE]);
        assert_eq!(&out[PcapGlobalHeader::SIZE..], [record, record].concat().as_slice());
    }

    #[test]
    fn test_payload_override_fixes_lengths() {
        let original = pcap_file(link_type::ETHERNET, &[(1, 0, tcp_packet(b"abc"))]);
        let mut reader = PcapReader::from_reader(original.as_slice()).unwrap();
        let tcp = reader
            .next_packet()
            .unwrap()
            .unwrap()
            .get_packet(Protocol::Tcp)
            .unwrap()
            .unwrap();

        let mut writer = PcapWriter::new(Vec::new());
        writer
            .write_packet_with(&tcp, Some(&Buffer::from(b"abcdef".to_vec())))
            .unwrap();
        let out = writer.into_inner().unwrap();

        let record = &out[PcapGlobalHeader::SIZE..];
        let captured = u32::from_le_bytes([record[8], record[9], record[10], record[11]]);
        assert_eq!(captured as usize, 14 + 20 + 20 + 6);
        let ip = &record[16 + 14..];
        assert_eq!(u16::from_be_bytes([ip[2], ip[3]]), 46);

        // The rewritten record decodes again
        let mut again = PcapReader::from_reader(out.as_slice()).unwrap();
        let tcp = again
            .next_packet()
            .unwrap()
            .unwrap()
            .get_packet(Protocol::Tcp)
            .unwrap()
            .unwrap();
        assert_eq!(tcp.frame().payload().to_vec(), b"abcdef");
    }

    #[test]
    fn test_header_converted_to_requested_byte_order() {
        let original = pcap_file(link_type::ETHERNET, &[(7, 500, tcp_packet(b"x"))]);
        let mut reader = PcapReader::from_reader(original.as_slice()).unwrap();
        let root = reader.next_packet().unwrap().unwrap();

        let header = PcapGlobalHeader {
            byte_order: ByteOrder::Big,
            precision: TimestampPrecision::Nano,
            ..PcapGlobalHeader::default_for(link_type::ETHERNET)
        };
        let mut writer = PcapWriter::with_header(Vec::new(), header);
        writer.write_packet(&root).unwrap();
        let out = writer.into_inner().unwrap();

        let mut again = PcapReader::from_reader(out.as_slice()).unwrap();
        assert_eq!(again.global_header().byte_order, ByteOrder::Big);
        let copy = again.next_packet().unwrap().unwrap();
        assert_eq!(copy.arrival_time(), 7_000_500);
        assert_eq!(
            copy.frame().payload().to_vec(),
            root.frame().payload().to_vec()
        );
    }

    #[test]
    fn test_header_derived_from_link_protocol() {
        let frame = Frame::decode(
            &default_registry(),
            Protocol::Ethernet,
            Buffer::from(tcp_packet(b"raw")),
        )
        .unwrap()
        .unwrap();

        let mut writer = PcapWriter::new(Vec::new());
        writer.write_frame(&frame).unwrap();
        assert_eq!(writer.header().unwrap().link_type, link_type::ETHERNET);
        let out = writer.into_inner().unwrap();

        let mut reader = PcapReader::from_reader(out.as_slice()).unwrap();
        let root = reader.next_packet().unwrap().unwrap();
        assert!(root.has_protocol(Protocol::Tcp).unwrap());
    }

    #[test]
    fn test_link_type_mismatch_rejected() {
        let original = pcap_file(link_type::ETHERNET, &[(1, 0, tcp_packet(b"x"))]);
        let mut reader = PcapReader::from_reader(original.as_slice()).unwrap();
        let root = reader.next_packet().unwrap().unwrap();

        let header = PcapGlobalHeader::default_for(link_type::LINUX_SLL);
        let mut writer = PcapWriter::with_header(Vec::new(), header);
        let err = writer.write_packet(&root).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Pcap(PcapError::UnsupportedLinkType { link_type: 1 })
        ));
        assert_eq!(writer.records_written(), 0);
    }

    #[test]
    fn test_missing_header_for_bare_transport() {
        let frame = Frame::decode(
            &default_registry(),
            Protocol::Tcp,
            Buffer::from(TcpBuilder::new().build()),
        )
        .unwrap()
        .unwrap();

        let mut writer = PcapWriter::new(Vec::new());
        let err = writer.write_frame(&frame).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Usage(UsageError::MissingHeader(_))
        ));
        assert!(writer.into_inner().unwrap().is_empty());
    }
}
