//! Interpreted views of frames.
//!
//! A [`Packet`] pairs a [`Frame`] with the protocol-specific view its decoder
//! produced. Views are built only when asked for and then memoized on the
//! frame, so walking a packet chain never parses a layer twice.

use std::any::Any;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::{DecodeError, Error, UsageError};
use crate::frame::{Frame, RecordInfo};
use crate::protocol::Protocol;

/// Protocol-specific interpretation of one frame.
pub trait ProtocolPacket: Send + Sync + fmt::Debug + Any {
    fn protocol(&self) -> Protocol;

    fn as_any(&self) -> &dyn Any;

    /// Bytes this layer emits around `payload` when written.
    ///
    /// The default reproduces the captured header and trailer. Layers with
    /// length or checksum fields override this to keep them consistent when
    /// `payload` differs from what was captured.
    ///
    /// Fails when `payload` no longer fits the layer's length fields.
    fn encapsulate(&self, frame: &Frame, payload: &Buffer) -> Result<Buffer, DecodeError> {
        Ok(Buffer::concat(&[&frame.header(), payload, &frame.trailer()]))
    }
}

/// A frame together with its parsed view.
///
/// `Clone` is cheap and shares everything; use [`Packet::deep_clone`] for an
/// independent copy.
#[derive(Clone)]
pub struct Packet {
    frame: Frame,
    view: Arc<dyn ProtocolPacket>,
}

impl Packet {
    pub(crate) fn new(frame: Frame, view: Arc<dyn ProtocolPacket>) -> Self {
        Packet { frame, view }
    }

    pub fn protocol(&self) -> Protocol {
        self.view.protocol()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn record_info(&self) -> RecordInfo {
        self.frame.record_info()
    }

    /// Capture timestamp of the record, in microseconds since the epoch.
    pub fn arrival_time(&self) -> i64 {
        self.frame.record_info().timestamp_us
    }

    /// The packet this one is carried in.
    pub fn parent_packet(&self) -> Result<Option<Packet>, DecodeError> {
        self.frame.parent().map(|frame| frame.parse()).transpose()
    }

    /// The packet carried in this one's payload, if any decoder claims it.
    pub fn next_packet(&self) -> Result<Option<Packet>, DecodeError> {
        self.frame
            .next_frame()?
            .map(|frame| frame.parse())
            .transpose()
    }

    /// This packet or the first packet below it carrying `protocol`.
    ///
    /// Layers between here and the match are framed but not parsed.
    pub fn get_packet(&self, protocol: Protocol) -> Result<Option<Packet>, DecodeError> {
        if self.protocol() == protocol {
            return Ok(Some(self.clone()));
        }
        self.frame
            .find_frame(protocol)?
            .map(|frame| frame.parse())
            .transpose()
    }

    /// Whether this packet or one below it carries `protocol`, settled by
    /// frame boundaries alone.
    pub fn has_protocol(&self, protocol: Protocol) -> Result<bool, DecodeError> {
        self.frame.has_protocol(protocol)
    }

    /// The typed view, if this packet is a `T`.
    pub fn downcast<T: ProtocolPacket>(&self) -> Option<&T> {
        self.view.as_any().downcast_ref::<T>()
    }

    /// The typed view, or a usage error naming what was found instead.
    pub fn view<T: ProtocolPacket>(&self) -> Result<&T, UsageError> {
        self.downcast::<T>()
            .ok_or_else(|| UsageError::WrongPacketKind {
                expected: short_type_name::<T>(),
                actual: self.protocol(),
            })
    }

    /// Serializes this packet, with `payload` replacing its captured payload,
    /// through every ancestor up to the record's top layer.
    pub fn encapsulated(&self, payload: Option<&Buffer>) -> Result<Buffer, DecodeError> {
        let payload = match payload {
            Some(payload) => payload.share(),
            None => self.frame.payload(),
        };
        let bytes = self.view.encapsulate(&self.frame, &payload)?;
        match self.parent_packet()? {
            Some(parent) => parent.encapsulated(Some(&bytes)),
            None => Ok(bytes),
        }
    }

    /// Writes the record this packet belongs to.
    ///
    /// Captured bytes come out verbatim unless `payload` overrides this
    /// packet's payload, in which case each ancestor fixes the lengths and
    /// checksums it knows about.
    pub fn write_to<W: Write + ?Sized>(
        &self,
        out: &mut W,
        payload: Option<&Buffer>,
    ) -> Result<(), Error> {
        self.encapsulated(payload)?.write_to(out)?;
        Ok(())
    }

    /// A fully independent copy sharing no storage with this packet.
    ///
    /// Ancestors are copied with it; layers below are re-framed from the
    /// copied bytes when first requested.
    pub fn deep_clone(&self) -> Result<Packet, DecodeError> {
        self.frame.deep_clone().parse()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("depth", &self.frame.depth())
            .field("view", &self.view)
            .finish()
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
