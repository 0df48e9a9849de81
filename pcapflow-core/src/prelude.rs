//! Convenient re-exports for common usage.
//!
//! # Example
//!
//! ```rust,no_run
//! use pcapflow_core::prelude::*;
//!
//! let reader = FilePcapReader::open("capture.pcap")?;
//! println!("link type {}", reader.link_type());
//! # Ok::<(), pcapflow_core::Error>(())
//! ```

// Core types
pub use crate::buffer::Buffer;
pub use crate::frame::Frame;
pub use crate::packet::Packet;

// Protocol types
pub use crate::protocol::{
    default_registry, ApplicationPacket, DecoderRegistry, EthernetPacket, Ipv4Packet, Ipv6Packet,
    Layer, PcapPacket, Protocol, RtpPacket, SctpPacket, SllPacket, TcpPacket, UdpPacket,
};

// Capture I/O
pub use crate::pcap::{FilePcapReader, PcapReader, PcapWriter};

// Streams
pub use crate::stream::{
    FlowId, FragmentListener, StreamListener, TcpState, TcpStream, TcpStreamHandler,
};

// Error types
pub use crate::error::{Error, Result};
