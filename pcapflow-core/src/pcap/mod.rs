//! Capture file reading and writing.
//!
//! The main types are:
//! - [`PcapReader`] - decodes each record of a PCAP/PCAPNG capture into a packet chain
//! - [`PcapWriter`] - writes packets back out as a legacy PCAP stream
//! - [`PcapGlobalHeader`] / [`RecordHeader`] - the legacy container headers

mod header;
mod reader;
mod writer;

pub use header::{
    ByteOrder, PcapGlobalHeader, RecordHeader, TimestampPrecision, MAGIC_MICRO, MAGIC_NANO,
    PCAPNG_MAGIC,
};
pub use reader::{FilePcapReader, PcapReader, ReaderConfig};
pub use writer::PcapWriter;
