//! Decoder contract and the registry that dispatches to decoders.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::{
    ApplicationDecoder, EthernetDecoder, Ipv4Decoder, Ipv6Decoder, Layer, Protocol, RtpDecoder,
    SctpDecoder, SllDecoder, TcpDecoder, UdpDecoder,
};
use crate::buffer::Buffer;
use crate::error::{DecodeError, UsageError};
use crate::frame::Frame;
use crate::packet::{Packet, ProtocolPacket};

/// Where the chain continues after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextLayer {
    /// The header names the next protocol; look its decoder up directly.
    Protocol(Protocol),
    /// Only the layer is known; ask that layer's decoders in order.
    Layer(Layer),
    /// Nothing follows.
    End,
}

/// One layer cut off a buffer by [`Decoder::frame`].
#[derive(Debug)]
pub struct Framed {
    /// This layer's own header bytes.
    pub header: Buffer,
    /// Bytes handed to the next layer.
    pub payload: Buffer,
    /// Bytes after the payload that still belong to this layer (e.g. link
    /// padding past an IPv4 total length). Usually empty.
    pub trailer: Buffer,
    pub next: NextLayer,
}

impl Framed {
    pub fn new(header: Buffer, payload: Buffer, next: NextLayer) -> Self {
        Framed {
            header,
            payload,
            trailer: Buffer::empty(),
            next,
        }
    }

    pub fn with_trailer(mut self, trailer: Buffer) -> Self {
        self.trailer = trailer;
        self
    }
}

/// Sniff-and-frame unit for one protocol.
///
/// `accept` must be cheap and conservative: it only looks at bytes from the
/// cursor on and cannot move the cursor. A decoder that accepted and then
/// fails in `frame` aborts the record's chain; no other decoder is tried.
pub trait Decoder: Send + Sync + fmt::Debug {
    /// The protocol this decoder produces frames for.
    fn protocol(&self) -> Protocol;

    /// Layer this decoder registers under.
    fn layer(&self) -> Layer {
        self.protocol().layer()
    }

    /// Could this protocol start at `buffer`'s cursor?
    fn accept(&self, buffer: &Buffer) -> bool;

    /// Consumes exactly this layer's header from `buffer`.
    fn frame(&self, parent: Option<&Frame>, buffer: &mut Buffer) -> Result<Framed, DecodeError>;

    /// Interprets a frame this decoder produced.
    fn parse(
        &self,
        frame: &Frame,
        parent: Option<&Packet>,
    ) -> Result<Arc<dyn ProtocolPacket>, DecodeError>;
}

/// Immutable set of decoders indexed by protocol and by layer.
///
/// Build one with [`DecoderRegistry::builder`] (or take [`default_registry`])
/// and share it behind an `Arc`; nothing mutates it afterwards.
#[derive(Default)]
pub struct DecoderRegistry {
    by_protocol: HashMap<Protocol, Arc<dyn Decoder>>,
    by_layer: HashMap<Layer, SmallVec<[Arc<dyn Decoder>; 4]>>,
}

impl DecoderRegistry {
    /// Start an empty registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Decoder registered for exactly `protocol`.
    pub fn decoder(&self, protocol: Protocol) -> Option<&Arc<dyn Decoder>> {
        self.by_protocol.get(&protocol)
    }

    /// First decoder of `layer`, in registration order, that accepts `buffer`.
    ///
    /// `None` is the normal answer for payloads nobody understands.
    pub fn detect(&self, layer: Layer, buffer: &Buffer) -> Option<&Arc<dyn Decoder>> {
        self.by_layer
            .get(&layer)?
            .iter()
            .find(|decoder| decoder.accept(buffer))
    }

    /// Resolves a layer's declared successor to a decoder.
    pub fn resolve(&self, next: NextLayer, buffer: &Buffer) -> Option<&Arc<dyn Decoder>> {
        match next {
            NextLayer::Protocol(protocol) => self.decoder(protocol),
            NextLayer::Layer(layer) => self.detect(layer, buffer),
            NextLayer::End => None,
        }
    }

    /// Protocols registered for `layer`, in detection order.
    pub fn protocols_for_layer(&self, layer: Layer) -> Vec<Protocol> {
        self.by_layer
            .get(&layer)
            .map(|decoders| decoders.iter().map(|d| d.protocol()).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.by_protocol.contains_key(&protocol)
    }

    pub fn len(&self) -> usize {
        self.by_protocol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_protocol.is_empty()
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.by_protocol.keys().collect();
        protocols.sort();
        f.debug_struct("DecoderRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

/// Collects decoders before freezing them into a [`DecoderRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    registry: DecoderRegistry,
}

impl RegistryBuilder {
    /// Builder pre-loaded with every built-in decoder.
    pub fn with_builtin_decoders() -> Self {
        let mut builder = RegistryBuilder::default();
        let builtins: [Arc<dyn Decoder>; 11] = [
            Arc::new(EthernetDecoder),
            Arc::new(SllDecoder),
            Arc::new(Ipv4Decoder),
            Arc::new(Ipv6Decoder),
            Arc::new(TcpDecoder),
            Arc::new(UdpDecoder),
            Arc::new(SctpDecoder),
            // Detection order matters here: RTP must stay last.
            Arc::new(ApplicationDecoder::sip()),
            Arc::new(ApplicationDecoder::diameter()),
            Arc::new(ApplicationDecoder::gtp()),
            Arc::new(RtpDecoder),
        ];
        for decoder in builtins {
            builder.insert(decoder);
        }
        builder
    }

    fn insert(&mut self, decoder: Arc<dyn Decoder>) {
        let protocol = decoder.protocol();
        let layer = decoder.layer();
        tracing::debug!(%protocol, %layer, "registered decoder");
        self.registry
            .by_layer
            .entry(layer)
            .or_default()
            .push(Arc::clone(&decoder));
        self.registry.by_protocol.insert(protocol, decoder);
    }

    /// Adds `decoder`, failing if its protocol already has one.
    pub fn register<D: Decoder + 'static>(self, decoder: D) -> Result<Self, UsageError> {
        self.register_arc(Arc::new(decoder))
    }

    pub fn register_arc(mut self, decoder: Arc<dyn Decoder>) -> Result<Self, UsageError> {
        if self.registry.contains(decoder.protocol()) {
            return Err(UsageError::DuplicateDecoder(decoder.protocol()));
        }
        self.insert(decoder);
        Ok(self)
    }

    pub fn build(self) -> Arc<DecoderRegistry> {
        Arc::new(self.registry)
    }
}

/// Registry holding every built-in decoder.
pub fn default_registry() -> Arc<DecoderRegistry> {
    RegistryBuilder::with_builtin_decoders().build()
}
