//! # pcapflow-core
//!
//! Lazy, layered packet decoding and TCP flow tracking for PCAP captures.
//!
//! Each capture record becomes a chain of protocol [`Frame`]s that is only
//! built as far as someone asks: finding the TCP header of a record frames
//! the link and network layers on the way but never looks at the payload.
//! A [`Packet`] is a frame plus its parsed protocol view.
//!
//! ## Features
//!
//! - **Zero-copy buffers**: every layer is a shared slice of the record bytes
//! - **Plug-in decoders**: a [`DecoderRegistry`] of sniff-then-frame decoders
//!   (PCAP record, Ethernet, Linux SLL, IPv4, IPv6, TCP, UDP, SCTP, RTP,
//!   SIP, Diameter, GTP)
//! - **Capture I/O**: PCAP and PCAPNG reading, including gzip/zstd
//!   compression, and a streaming legacy PCAP writer
//! - **TCP streams**: a per-flow state machine that follows handshakes,
//!   half-closes, resets and port reuse
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::ops::ControlFlow;
//! use pcapflow_core::prelude::*;
//!
//! let mut reader = FilePcapReader::open("capture.pcap")?;
//! let mut streams = TcpStreamHandler::new();
//!
//! reader.process_packets(|packet| {
//!     streams.process(&packet);
//!     Ok(ControlFlow::Continue(()))
//! })?;
//! streams.finish();
//!
//! for stream in streams.streams() {
//!     println!("{} {} ({} packets)", stream.flow(), stream.state(), stream.packet_count());
//! }
//! # Ok::<(), pcapflow_core::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        pcapflow-core                                |
//! +---------------------------------------------------------------------+
//! |  buffer      - Buffer: shared, sliceable bytes with reader/writer   |
//! |  protocol/   - Protocol, Layer, Decoder trait, built-in decoders    |
//! |  frame       - Frame: one decoded layer, lazily linked to the next  |
//! |  packet      - Packet: a frame with its parsed protocol view        |
//! |  pcap/       - PCAP/PCAPNG reader, PCAP writer, container headers   |
//! |  io/         - compression detection and decompression              |
//! |  stream/     - FlowId, TCP state machine, stream handler            |
//! |  error       - Error types                                          |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Crate Features
//!
//! - `default` - Gzip and Zstd compression enabled
//! - `compress-gzip` - Gzip decompression support
//! - `compress-zstd` - Zstd decompression support

pub mod buffer;
pub mod error;
pub mod frame;
pub mod io;
pub mod packet;
pub mod pcap;
pub mod prelude;
pub mod protocol;
pub mod stream;

// Re-export commonly used types at crate root for convenience
pub use buffer::Buffer;
pub use error::{BufferError, DecodeError, Error, PcapError, Result, UsageError};
pub use frame::{Frame, RecordInfo, DEFAULT_MAX_CHAIN_DEPTH};
pub use io::Compression;
pub use packet::{Packet, ProtocolPacket};
pub use pcap::{FilePcapReader, PcapGlobalHeader, PcapReader, PcapWriter, ReaderConfig};
pub use protocol::{
    default_registry, Decoder, DecoderRegistry, Framed, Layer, NextLayer, Protocol,
    RegistryBuilder,
};
pub use stream::{
    FlowId, FragmentListener, StreamConfig, StreamListener, TcpState, TcpStream,
    TcpStreamHandler,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
