//! Capture reader driving the decoder chain record by record.
//!
//! Container parsing is delegated to `pcap_parser` for both legacy PCAP and
//! PCAPNG. Each record is handed to the decoder chain as its 16-byte record
//! header followed by the captured bytes, with a [`PcapDecoder`] as the top
//! layer. PCAPNG records get a synthesized little-endian microsecond header,
//! converted from whatever timestamp resolution their interface declares.

use std::fs::File;
use std::io::{BufReader, Chain, Cursor, Read};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapNGReader};

use super::{ByteOrder, PcapGlobalHeader, RecordHeader, TimestampPrecision, PCAPNG_MAGIC};
use crate::buffer::Buffer;
use crate::error::{Error, PcapError, Result};
use crate::frame::{Frame, RecordInfo, DEFAULT_MAX_CHAIN_DEPTH};
use crate::io::Decompressed;
use crate::packet::Packet;
use crate::protocol::{default_registry, link_type, DecoderRegistry, PcapDecoder};

/// Reader tuning.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Buffer size handed to `pcap_parser`; bounds the largest record.
    pub buffer_size: usize,
    /// Maximum decoded layers per record.
    pub max_chain_depth: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 65536,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }
}

/// The source with the bytes consumed for format detection put back in front.
type Source<R> = Chain<Cursor<Vec<u8>>, R>;

enum ReaderInner<R: Read> {
    Legacy(LegacyPcapReader<BufReader<Source<R>>>),
    Ng(PcapNGReader<BufReader<Source<R>>>),
}

/// Timestamp units of one capture interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TsResolution {
    units_per_second: u64,
    /// Seconds added to every timestamp (`if_tsoffset`).
    offset_sec: i64,
}

impl Default for TsResolution {
    fn default() -> Self {
        TsResolution {
            units_per_second: 1_000_000,
            offset_sec: 0,
        }
    }
}

impl TsResolution {
    /// Decode an `if_tsresol` byte: a power of ten, or of two when the high
    /// bit is set.
    fn from_tsresol(tsresol: u8, offset_sec: i64) -> Option<Self> {
        let exponent = u32::from(tsresol & 0x7f);
        let units_per_second = if tsresol & 0x80 == 0 {
            10u64.checked_pow(exponent)?
        } else {
            2u64.checked_pow(exponent)?
        };
        Some(TsResolution {
            units_per_second,
            offset_sec,
        })
    }

    fn to_micros(self, ts_high: u32, ts_low: u32) -> i64 {
        let ts = (u64::from(ts_high) << 32) | u64::from(ts_low);
        let secs = i64::try_from(ts / self.units_per_second).unwrap_or(i64::MAX);
        let frac = u128::from(ts % self.units_per_second);
        // frac < units_per_second, so this is below one million
        let micros = (frac * 1_000_000 / u128::from(self.units_per_second)) as i64;
        secs.saturating_add(self.offset_sec)
            .saturating_mul(1_000_000)
            .saturating_add(micros)
    }
}

/// A capture interface: legacy files have exactly one.
struct Interface {
    decoder: Arc<PcapDecoder>,
    resolution: TsResolution,
}

/// A record as read from the container, before decoding.
struct RawRecord {
    interface: usize,
    header: RecordHeader,
    data: Vec<u8>,
}

/// Reads a capture and yields the top-level [`Packet`] of each record.
///
/// A record that fails to decode is logged and skipped; the reader carries on
/// with the next one. Only an unreadable container ends iteration with an
/// error.
///
/// # Example
///
/// ```rust,no_run
/// use std::ops::ControlFlow;
/// use pcapflow_core::prelude::*;
///
/// let mut reader = FilePcapReader::open("capture.pcap.gz")?;
/// reader.process_packets(|packet| {
///     if let Some(tcp) = packet.get_packet(Protocol::Tcp)? {
///         println!("{:?}", tcp.view::<TcpPacket>()?.flags());
///     }
///     Ok(ControlFlow::Continue(()))
/// })?;
/// # Ok::<(), pcapflow_core::Error>(())
/// ```
pub struct PcapReader<R: Read> {
    inner: ReaderInner<R>,
    registry: Arc<DecoderRegistry>,
    config: ReaderConfig,
    header: PcapGlobalHeader,
    /// Interfaces of the current section, by interface id.
    interfaces: Vec<Interface>,
    frame_number: u64,
    skipped: u64,
}

/// Reader over a possibly compressed capture file.
pub type FilePcapReader = PcapReader<Decompressed<BufReader<File>>>;

impl FilePcapReader {
    /// Open a capture file with the default registry and configuration.
    ///
    /// Gzip and zstd compression are detected and removed transparently.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, default_registry(), ReaderConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        registry: Arc<DecoderRegistry>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|_| PcapError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let source = Decompressed::sniff(BufReader::new(file)).map_err(|e| {
            PcapError::InvalidFormat {
                reason: format!("unreadable compressed capture: {e}"),
            }
        })?;
        tracing::debug!(
            path = %path.display(),
            compression = %source.compression(),
            "opening capture"
        );
        PcapReader::with_config(source, registry, config)
    }
}

impl<R: Read> PcapReader<R> {
    /// Read an uncompressed capture from any byte source.
    pub fn from_reader(source: R) -> Result<Self> {
        Self::with_config(source, default_registry(), ReaderConfig::default())
    }

    pub fn with_config(
        mut source: R,
        registry: Arc<DecoderRegistry>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let mut prefix = vec![0u8; 4];
        source.read_exact(&mut prefix).map_err(|_| PcapError::InvalidFormat {
            reason: "capture too short to hold a magic number".to_string(),
        })?;

        if prefix.as_slice() == PCAPNG_MAGIC {
            let reader = PcapNGReader::new(config.buffer_size, buffered(prefix, source, &config))
                .map_err(|e| PcapError::InvalidFormat {
                    reason: format!("failed to parse PCAPNG: {e}"),
                })?;
            return Ok(Self::new(
                ReaderInner::Ng(reader),
                registry,
                config,
                // Replaced by the first interface description
                PcapGlobalHeader::default_for(link_type::ETHERNET),
                Vec::new(),
            ));
        }

        let mut reader =
            LegacyPcapReader::new(config.buffer_size, buffered(prefix, source, &config))
                .map_err(|e| PcapError::InvalidFormat {
                    reason: format!("failed to parse legacy PCAP: {e}"),
                })?;
        let header = read_legacy_header(&mut reader)?;
        tracing::debug!(
            link_type = header.link_type,
            byte_order = ?header.byte_order,
            precision = ?header.precision,
            "legacy capture header"
        );
        Ok(Self::new(
            ReaderInner::Legacy(reader),
            registry,
            config,
            header,
            vec![Interface {
                decoder: Arc::new(PcapDecoder::new(header)),
                resolution: TsResolution::default(),
            }],
        ))
    }

    fn new(
        inner: ReaderInner<R>,
        registry: Arc<DecoderRegistry>,
        config: ReaderConfig,
        header: PcapGlobalHeader,
        interfaces: Vec<Interface>,
    ) -> Self {
        PcapReader {
            inner,
            registry,
            config,
            header,
            interfaces,
            frame_number: 0,
            skipped: 0,
        }
    }

    /// Global header of the capture.
    ///
    /// For PCAPNG this is synthesized from the first interface description
    /// of the section being read.
    pub fn global_header(&self) -> &PcapGlobalHeader {
        &self.header
    }

    pub fn link_type(&self) -> u32 {
        self.header.link_type
    }

    pub fn registry(&self) -> &Arc<DecoderRegistry> {
        &self.registry
    }

    /// Records read so far, skipped ones included.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Records dropped because they failed to decode.
    pub fn skipped_records(&self) -> u64 {
        self.skipped
    }

    /// Read and decode the next record.
    ///
    /// Returns `Ok(None)` at end of capture.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let raw = match &mut self.inner {
                ReaderInner::Legacy(reader) => read_legacy_record(reader)?,
                ReaderInner::Ng(reader) => {
                    read_pcapng_record(reader, &mut self.interfaces, &mut self.header)?
                }
            };
            let Some(raw) = raw else {
                return Ok(None);
            };
            self.frame_number += 1;

            let Some(decoder) = self
                .interfaces
                .get(raw.interface)
                .map(|interface| Arc::clone(&interface.decoder))
            else {
                tracing::warn!(
                    frame_number = self.frame_number,
                    interface = raw.interface,
                    "skipping record from undeclared interface"
                );
                self.skipped += 1;
                continue;
            };

            let global = *decoder.global_header();
            let info = RecordInfo {
                frame_number: self.frame_number,
                timestamp_us: raw.header.timestamp_us(global.precision),
            };
            let mut bytes = Vec::with_capacity(RecordHeader::SIZE + raw.data.len());
            bytes.extend_from_slice(&raw.header.encode(global.byte_order));
            bytes.extend_from_slice(&raw.data);

            let decoded = Frame::decode_record(
                Arc::clone(&self.registry),
                decoder,
                Buffer::from(bytes),
                info,
                self.config.max_chain_depth,
            )
            .and_then(|frame| frame.parse());

            match decoded {
                Ok(packet) => {
                    tracing::trace!(frame_number = self.frame_number, "record decoded");
                    return Ok(Some(packet));
                }
                Err(e) => {
                    tracing::warn!(
                        frame_number = self.frame_number,
                        error = %e,
                        "skipping malformed record"
                    );
                    self.skipped += 1;
                }
            }
        }
    }

    /// Calls `f` with each record's top-level packet until the capture ends
    /// or `f` breaks.
    ///
    /// Returns the number of packets handed to `f`.
    pub fn process_packets<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(Packet) -> Result<ControlFlow<()>>,
    {
        let mut processed = 0;
        while let Some(packet) = self.next_packet()? {
            processed += 1;
            if f(packet)?.is_break() {
                break;
            }
        }
        Ok(processed)
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

fn buffered<R: Read>(prefix: Vec<u8>, source: R, config: &ReaderConfig) -> BufReader<Source<R>> {
    BufReader::with_capacity(config.buffer_size, Cursor::new(prefix).chain(source))
}

fn container_error(format: &str, e: impl std::fmt::Display) -> Error {
    Error::Pcap(PcapError::InvalidFormat {
        reason: format!("{format} parse error: {e}"),
    })
}

/// Pull the global header, which `pcap_parser` yields as the first block.
fn read_legacy_header<S: Read>(reader: &mut LegacyPcapReader<S>) -> Result<PcapGlobalHeader> {
    use pcap_parser::PcapError as PcapParserError;

    loop {
        match reader.next() {
            Ok((offset, PcapBlockOwned::LegacyHeader(header))) => {
                let global = PcapGlobalHeader {
                    byte_order: if header.is_bigendian() {
                        ByteOrder::Big
                    } else {
                        ByteOrder::Little
                    },
                    precision: if header.is_nanosecond_precision() {
                        TimestampPrecision::Nano
                    } else {
                        TimestampPrecision::Micro
                    },
                    version_major: header.version_major,
                    version_minor: header.version_minor,
                    thiszone: header.thiszone,
                    sigfigs: header.sigfigs,
                    snaplen: header.snaplen,
                    link_type: header.network.0 as u32,
                };
                reader.consume(offset);
                return Ok(global);
            }
            Ok(_) => return Err(container_error("legacy PCAP", "record before global header")),
            Err(PcapParserError::Eof) => {
                return Err(container_error("legacy PCAP", "no global header"));
            }
            Err(PcapParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| container_error("legacy PCAP refill", e))?;
            }
            Err(e) => return Err(container_error("legacy PCAP", e)),
        }
    }
}

/// Read the next record from a legacy PCAP reader.
fn read_legacy_record<S: Read>(reader: &mut LegacyPcapReader<S>) -> Result<Option<RawRecord>> {
    use pcap_parser::PcapError as PcapParserError;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let record = match block {
                    PcapBlockOwned::Legacy(packet) => Some(RawRecord {
                        interface: 0,
                        header: RecordHeader {
                            ts_sec: packet.ts_sec,
                            ts_frac: packet.ts_usec,
                            captured_length: packet.caplen,
                            original_length: packet.origlen,
                        },
                        data: packet.data.to_vec(),
                    }),
                    _ => None,
                };
                reader.consume(offset);
                if record.is_some() {
                    return Ok(record);
                }
            }
            Err(PcapParserError::Eof) => return Ok(None),
            Err(PcapParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| container_error("legacy PCAP refill", e))?;
            }
            Err(e) => return Err(container_error("legacy PCAP", e)),
        }
    }
}

/// Read the next packet record from a PCAPNG reader, registering interfaces
/// as their descriptions go by.
///
/// Interface ids are scoped to a section, so a section header block drops
/// every interface seen so far.
fn read_pcapng_record<S: Read>(
    reader: &mut PcapNGReader<S>,
    interfaces: &mut Vec<Interface>,
    header: &mut PcapGlobalHeader,
) -> Result<Option<RawRecord>> {
    use pcap_parser::pcapng::Block;
    use pcap_parser::PcapError as PcapParserError;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let record = match block {
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        if !interfaces.is_empty() {
                            tracing::debug!(dropped = interfaces.len(), "new pcapng section");
                        }
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        let interface = PcapGlobalHeader {
                            snaplen: idb.snaplen,
                            ..PcapGlobalHeader::default_for(idb.linktype.0 as u32)
                        };
                        let offset_sec = i64::try_from(idb.if_tsoffset).unwrap_or(0);
                        let resolution = TsResolution::from_tsresol(idb.if_tsresol, offset_sec)
                            .unwrap_or_else(|| {
                                tracing::warn!(
                                    if_tsresol = idb.if_tsresol,
                                    "unrepresentable timestamp resolution, assuming microseconds"
                                );
                                TsResolution {
                                    offset_sec,
                                    ..TsResolution::default()
                                }
                            });
                        if interfaces.is_empty() {
                            *header = interface;
                        }
                        tracing::debug!(
                            interface = interfaces.len(),
                            link_type = interface.link_type,
                            units_per_second = resolution.units_per_second,
                            "pcapng interface"
                        );
                        interfaces.push(Interface {
                            decoder: Arc::new(PcapDecoder::new(interface)),
                            resolution,
                        });
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let resolution = interfaces
                            .get(epb.if_id as usize)
                            .map(|interface| interface.resolution)
                            .unwrap_or_default();
                        let timestamp_us = resolution.to_micros(epb.ts_high, epb.ts_low);
                        let data = epb.data.get(..epb.caplen as usize).unwrap_or(epb.data);
                        Some(RawRecord {
                            interface: epb.if_id as usize,
                            header: RecordHeader::from_micros(
                                timestamp_us,
                                data.len() as u32,
                                epb.origlen,
                            ),
                            data: data.to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        let data = spb.data.get(..spb.origlen as usize).unwrap_or(spb.data);
                        Some(RawRecord {
                            interface: 0,
                            header: RecordHeader::from_micros(0, data.len() as u32, spb.origlen),
                            data: data.to_vec(),
                        })
                    }
                    _ => None,
                };
                reader.consume(offset);
                if record.is_some() {
                    return Ok(record);
                }
            }
            Err(PcapParserError::Eof) => return Ok(None),
            Err(PcapParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| container_error("PCAPNG refill", e))?;
            }
            Err(e) => return Err(container_error("PCAPNG", e)),
        }
    }
}
