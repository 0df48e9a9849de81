//! Error types for pcapflow-core.
//!
//! Errors are grouped by who is at fault:
//!
//! - [`BufferError`] - an access outside a [`Buffer`](crate::Buffer)'s bounds, or a
//!   scan or number parse over its bytes that came up empty
//! - [`DecodeError`] - malformed input; aborts decoding of one record only
//! - [`UsageError`] - the caller misconfigured something or asked the wrong question
//! - [`PcapError`] - the capture container itself is unreadable
//!
//! "No decoder claims this payload" and "protocol not present" are not errors;
//! they surface as `None`.

use thiserror::Error;

use crate::buffer::Buffer;
use crate::protocol::Protocol;

/// Main error type for pcapflow-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading or parsing the capture container
    #[error("PCAP error: {0}")]
    Pcap(#[from] PcapError),

    /// Malformed protocol data
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// API misuse
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// Out-of-bounds buffer access
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Out-of-bounds access on a [`Buffer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("index {index} (+{length}) out of bounds for capacity {capacity}")]
    OutOfBounds {
        index: usize,
        length: usize,
        capacity: usize,
    },

    /// No delimiter within the bytes a scan was allowed to look at
    #[error("no delimiter within {max_bytes} bytes")]
    DelimiterLimit { max_bytes: usize },

    #[error("{text:?} is not a base-{radix} integer")]
    NotANumber { text: String, radix: u32 },
}

/// Malformed input found while framing or parsing one layer.
///
/// Offsets are measured from the start of the capture record, record header
/// included, so they can be matched against a hex dump of the file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the header needs
    #[error("{protocol}: truncated at offset {offset} (need {needed} bytes, have {available})")]
    Truncated {
        protocol: Protocol,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A header field holds a value outside its valid range
    #[error("{protocol}: invalid {field} at offset {offset}: {reason}")]
    InvalidField {
        protocol: Protocol,
        offset: usize,
        field: &'static str,
        reason: String,
    },
}

impl DecodeError {
    /// Truncation at `buffer`'s cursor.
    pub fn truncated(protocol: Protocol, buffer: &Buffer, needed: usize) -> Self {
        DecodeError::Truncated {
            protocol,
            offset: buffer.record_offset(),
            needed,
            available: buffer.readable_bytes(),
        }
    }

    /// Invalid field at `buffer`'s cursor.
    pub fn invalid(
        protocol: Protocol,
        buffer: &Buffer,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        DecodeError::InvalidField {
            protocol,
            offset: buffer.record_offset(),
            field,
            reason: reason.into(),
        }
    }

    /// Protocol whose decoder raised the error.
    pub fn protocol(&self) -> Protocol {
        match self {
            DecodeError::Truncated { protocol, .. } | DecodeError::InvalidField { protocol, .. } => {
                *protocol
            }
        }
    }

    /// Byte offset within the capture record.
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::Truncated { offset, .. } | DecodeError::InvalidField { offset, .. } => {
                *offset
            }
        }
    }
}

/// Converts a failed buffer read inside a decoder into a [`DecodeError`].
pub(crate) trait BufferResultExt<T> {
    fn in_protocol(self, protocol: Protocol, buffer: &Buffer) -> std::result::Result<T, DecodeError>;
}

impl<T> BufferResultExt<T> for std::result::Result<T, BufferError> {
    fn in_protocol(self, protocol: Protocol, buffer: &Buffer) -> std::result::Result<T, DecodeError> {
        self.map_err(|e| match e {
            BufferError::OutOfBounds { index, length, .. } => DecodeError::Truncated {
                protocol,
                offset: buffer.record_offset(),
                needed: index.saturating_sub(buffer.reader_index()) + length,
                available: buffer.readable_bytes(),
            },
            other => DecodeError::invalid(protocol, buffer, "content", other.to_string()),
        })
    }
}

/// Misconfiguration or a query against the wrong kind of packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Two decoders registered for one protocol
    #[error("a decoder for {0} is already registered")]
    DuplicateDecoder(Protocol),

    /// A typed view was requested from a packet of another protocol
    #[error("expected a {expected} packet, found {actual}")]
    WrongPacketKind {
        expected: &'static str,
        actual: Protocol,
    },

    /// The writer needs a global header and none could be derived
    #[error("cannot derive a capture header: {0}")]
    MissingHeader(String),

    /// A stream was asked for packets it was configured not to keep
    #[error("stream {0} did not keep its packets")]
    PacketsNotRetained(u64),
}

/// Errors related to the capture container.
#[derive(Error, Debug)]
pub enum PcapError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid PCAP format
    #[error("Invalid PCAP format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u32 },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
