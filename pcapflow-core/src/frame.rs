//! Lazily built chain of decoded layers for one capture record.
//!
//! A record's layers live in a single [`Record`] owned through an `Arc`. A
//! [`Frame`] is a handle `(record, depth)`: its parent is simply the layer at
//! `depth - 1`, so the chain has no reference cycles and any handle keeps the
//! whole record alive.
//!
//! Children are framed on first request and memoized; asking twice never runs
//! a decoder twice. Interpretation into a [`Packet`] is a separate, also
//! memoized, step.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use smallvec::SmallVec;

use crate::buffer::Buffer;
use crate::error::DecodeError;
use crate::packet::{Packet, ProtocolPacket};
use crate::protocol::{Decoder, DecoderRegistry, Framed, Layer, NextLayer, Protocol};

/// Default cap on the number of layers decoded per record.
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 16;

/// Where a record came from in its capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordInfo {
    /// 1-based position in the capture.
    pub frame_number: u64,
    /// Capture timestamp in microseconds since the epoch.
    pub timestamp_us: i64,
}

struct LayerNode {
    protocol: Protocol,
    decoder: Arc<dyn Decoder>,
    header: Buffer,
    payload: Buffer,
    trailer: Buffer,
    next: NextLayer,
    packet: OnceLock<Arc<dyn ProtocolPacket>>,
}

impl LayerNode {
    fn new(decoder: Arc<dyn Decoder>, framed: Framed) -> Self {
        LayerNode {
            protocol: decoder.protocol(),
            decoder,
            header: framed.header,
            payload: framed.payload,
            trailer: framed.trailer,
            next: framed.next,
            packet: OnceLock::new(),
        }
    }
}

#[derive(Default)]
struct Chain {
    layers: Vec<Arc<LayerNode>>,
    complete: bool,
}

struct Record {
    registry: Arc<DecoderRegistry>,
    info: RecordInfo,
    max_depth: usize,
    chain: Mutex<Chain>,
}

impl Record {
    fn chain(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One decoded layer of a capture record.
#[derive(Clone)]
pub struct Frame {
    record: Arc<Record>,
    depth: usize,
}

impl Frame {
    /// Frames `buffer` with `decoder` as the top layer of a new record.
    pub fn decode_record(
        registry: Arc<DecoderRegistry>,
        decoder: Arc<dyn Decoder>,
        mut buffer: Buffer,
        info: RecordInfo,
        max_depth: usize,
    ) -> Result<Frame, DecodeError> {
        let framed = decoder.frame(None, &mut buffer)?;
        let chain = Chain {
            layers: vec![Arc::new(LayerNode::new(decoder, framed))],
            complete: false,
        };
        Ok(Frame {
            record: Arc::new(Record {
                registry,
                info,
                max_depth: max_depth.max(1),
                chain: Mutex::new(chain),
            }),
            depth: 0,
        })
    }

    /// Frames `buffer` as a bare `protocol` layer, outside any capture.
    ///
    /// Returns `Ok(None)` when `registry` has no decoder for `protocol`.
    pub fn decode(
        registry: &Arc<DecoderRegistry>,
        protocol: Protocol,
        buffer: Buffer,
    ) -> Result<Option<Frame>, DecodeError> {
        let Some(decoder) = registry.decoder(protocol) else {
            return Ok(None);
        };
        Frame::decode_record(
            Arc::clone(registry),
            Arc::clone(decoder),
            buffer,
            RecordInfo::default(),
            DEFAULT_MAX_CHAIN_DEPTH,
        )
        .map(Some)
    }

    fn node(&self) -> Arc<LayerNode> {
        Arc::clone(&self.record.chain().layers[self.depth])
    }

    fn at(&self, depth: usize) -> Frame {
        Frame {
            record: Arc::clone(&self.record),
            depth,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.node().protocol
    }

    pub fn layer(&self) -> Layer {
        self.protocol().layer()
    }

    /// Position in the chain; the record's top layer is 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn record_info(&self) -> RecordInfo {
        self.record.info
    }

    pub fn registry(&self) -> &Arc<DecoderRegistry> {
        &self.record.registry
    }

    /// This layer's header bytes (shared, not copied).
    pub fn header(&self) -> Buffer {
        self.node().header.share()
    }

    /// Bytes carried for the next layer (shared, not copied).
    pub fn payload(&self) -> Buffer {
        self.node().payload.share()
    }

    /// Bytes this layer keeps after its payload.
    pub fn trailer(&self) -> Buffer {
        self.node().trailer.share()
    }

    pub fn next_layer(&self) -> NextLayer {
        self.node().next
    }

    pub fn parent(&self) -> Option<Frame> {
        self.depth.checked_sub(1).map(|depth| self.at(depth))
    }

    /// The record's top layer.
    pub fn root(&self) -> Frame {
        self.at(0)
    }

    /// Frames the next layer, or returns the memoized one.
    ///
    /// `Ok(None)` means the chain ends here: nothing is left, nothing follows,
    /// or no registered decoder claims the payload.
    pub fn next_frame(&self) -> Result<Option<Frame>, DecodeError> {
        let child = self.depth + 1;
        let current = {
            let mut chain = self.record.chain();
            if child < chain.layers.len() {
                return Ok(Some(self.at(child)));
            }
            if chain.complete {
                return Ok(None);
            }
            if child >= self.record.max_depth {
                tracing::debug!(depth = child, "frame chain reached its depth limit");
                chain.complete = true;
                return Ok(None);
            }
            Arc::clone(&chain.layers[self.depth])
        };

        let mut buffer = current.payload.slice_readable();
        let decoder = match self.record.registry.resolve(current.next, &buffer) {
            Some(decoder) if buffer.has_readable_bytes() => Arc::clone(decoder),
            _ => {
                tracing::trace!(
                    protocol = %current.protocol,
                    next = ?current.next,
                    "frame chain terminated"
                );
                self.record.chain().complete = true;
                return Ok(None);
            }
        };

        let framed = decoder.frame(Some(self), &mut buffer)?;
        let mut chain = self.record.chain();
        if chain.layers.len() == child {
            chain.layers.push(Arc::new(LayerNode::new(decoder, framed)));
        }
        Ok(Some(self.at(child)))
    }

    /// This frame or the first descendant carrying `protocol`.
    ///
    /// Only frame boundaries are computed; no packet is parsed.
    pub fn find_frame(&self, protocol: Protocol) -> Result<Option<Frame>, DecodeError> {
        let mut current = self.clone();
        loop {
            if current.protocol() == protocol {
                return Ok(Some(current));
            }
            match current.next_frame()? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
    }

    pub fn has_protocol(&self, protocol: Protocol) -> Result<bool, DecodeError> {
        Ok(self.find_frame(protocol)?.is_some())
    }

    /// Protocols from this frame to the end of the chain.
    pub fn protocols(&self) -> Result<SmallVec<[Protocol; 8]>, DecodeError> {
        let mut protocols = SmallVec::new();
        let mut current = Some(self.clone());
        while let Some(frame) = current {
            protocols.push(frame.protocol());
            current = frame.next_frame()?;
        }
        Ok(protocols)
    }

    /// Interprets this frame, parsing its ancestors first where needed.
    pub fn parse(&self) -> Result<Packet, DecodeError> {
        let node = self.node();
        if let Some(view) = node.packet.get() {
            return Ok(Packet::new(self.clone(), Arc::clone(view)));
        }

        let parent = match self.parent() {
            Some(frame) => Some(frame.parse()?),
            None => None,
        };
        let parsed = node.decoder.parse(self, parent.as_ref())?;
        let view = node.packet.get_or_init(|| parsed);
        Ok(Packet::new(self.clone(), Arc::clone(view)))
    }

    /// Whether this frame has been interpreted yet.
    pub fn is_parsed(&self) -> bool {
        self.node().packet.get().is_some()
    }

    /// Header, payload and trailer of this layer, as captured.
    pub fn to_buffer(&self) -> Buffer {
        let node = self.node();
        Buffer::concat(&[&node.header, &node.payload, &node.trailer])
    }

    /// Writes the whole record this frame belongs to.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        self.root().to_buffer().write_to(out)
    }

    /// Copies layers `0..=depth` onto fresh storage; children are re-framed
    /// from the copy on demand.
    pub(crate) fn deep_clone(&self) -> Frame {
        let layers: Vec<Arc<LayerNode>> = {
            let chain = self.record.chain();
            chain.layers[..=self.depth].to_vec()
        };
        let old = Arc::clone(layers[0].header.storage());
        let new = layers[0].header.copy_storage();

        let copied = layers
            .iter()
            .map(|node| {
                Arc::new(LayerNode {
                    protocol: node.protocol,
                    decoder: Arc::clone(&node.decoder),
                    header: node.header.rebind(&old, &new),
                    payload: node.payload.rebind(&old, &new),
                    trailer: node.trailer.rebind(&old, &new),
                    next: node.next,
                    packet: OnceLock::new(),
                })
            })
            .collect();

        Frame {
            record: Arc::new(Record {
                registry: Arc::clone(&self.record.registry),
                info: self.record.info,
                max_depth: self.record.max_depth,
                chain: Mutex::new(Chain {
                    layers: copied,
                    complete: false,
                }),
            }),
            depth: self.depth,
        }
    }

    /// Whether both handles point at the same record.
    pub fn same_record(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node();
        f.debug_struct("Frame")
            .field("protocol", &node.protocol)
            .field("depth", &self.depth)
            .field("header_len", &node.header.capacity())
            .field("payload_len", &node.payload.capacity())
            .field("next", &node.next)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::default_registry;
    use crate::protocol::test_utils::{EthernetBuilder, Ipv4Builder, TcpBuilder, UdpBuilder};

    fn tcp_over_ethernet() -> Vec<u8> {
        let tcp = TcpBuilder::new()
            .flags(0x18)
            .payload(b"hello".to_vec())
            .build();
        EthernetBuilder::new()
            .payload(Ipv4Builder::new().payload(tcp).build())
            .build()
    }

    #[test]
    fn test_chain_is_framed_lazily() {
        let registry = default_registry();
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(tcp_over_ethernet()))
            .unwrap()
            .unwrap();
        assert_eq!(eth.record.chain().layers.len(), 1);

        let ip = eth.next_frame().unwrap().unwrap();
        assert_eq!(ip.protocol(), Protocol::Ipv4);
        assert_eq!(eth.record.chain().layers.len(), 2);

        let again = eth.next_frame().unwrap().unwrap();
        assert!(again.same_record(&ip));
        assert_eq!(eth.record.chain().layers.len(), 2);
    }

    #[test]
    fn test_protocols_of_tcp_record() {
        let registry = default_registry();
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(tcp_over_ethernet()))
            .unwrap()
            .unwrap();
        assert_eq!(
            eth.protocols().unwrap().as_slice(),
            &[Protocol::Ethernet, Protocol::Ipv4, Protocol::Tcp]
        );
        // "hello" matches no application sniffer
        let tcp = eth.find_frame(Protocol::Tcp).unwrap().unwrap();
        assert_eq!(tcp.payload().to_vec(), b"hello");
        assert!(tcp.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_parent_links() {
        let registry = default_registry();
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(tcp_over_ethernet()))
            .unwrap()
            .unwrap();
        let tcp = eth.find_frame(Protocol::Tcp).unwrap().unwrap();
        let ip = tcp.parent().unwrap();
        assert_eq!(ip.protocol(), Protocol::Ipv4);
        assert_eq!(ip.parent().unwrap().protocol(), Protocol::Ethernet);
        assert!(eth.parent().is_none());
    }

    #[test]
    fn test_find_frame_does_not_parse() {
        let registry = default_registry();
        let udp = UdpBuilder::new().payload(vec![0xde, 0xad]).build();
        let bytes = EthernetBuilder::new()
            .payload(Ipv4Builder::new().udp().payload(udp).build())
            .build();
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(bytes))
            .unwrap()
            .unwrap();
        assert!(!eth.has_protocol(Protocol::Sip).unwrap());
        assert!(eth.has_protocol(Protocol::Udp).unwrap());
        let mut frame = Some(eth);
        while let Some(f) = frame {
            assert!(!f.is_parsed());
            frame = f.next_frame().unwrap();
        }
    }

    #[test]
    fn test_truncated_ip_header_is_a_decode_error() {
        let registry = default_registry();
        let mut bytes = EthernetBuilder::new().build();
        bytes.extend_from_slice(&[0x45, 0x00, 0x00, 0x28]); // 4 of 20 header bytes
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(bytes))
            .unwrap()
            .unwrap();
        let err = eth.next_frame().unwrap_err();
        assert_eq!(err.protocol(), Protocol::Ipv4);
        assert_eq!(err.offset(), 14);
    }

    #[test]
    fn test_depth_limit_ends_chain() {
        let registry = default_registry();
        let decoder = Arc::clone(registry.decoder(Protocol::Ethernet).unwrap());
        let eth = Frame::decode_record(
            registry,
            decoder,
            Buffer::from(tcp_over_ethernet()),
            RecordInfo::default(),
            2,
        )
        .unwrap();
        let ip = eth.next_frame().unwrap().unwrap();
        assert!(ip.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_write_reproduces_record() {
        let registry = default_registry();
        let bytes = tcp_over_ethernet();
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(bytes.clone()))
            .unwrap()
            .unwrap();
        let tcp = eth.find_frame(Protocol::Tcp).unwrap().unwrap();
        let mut out = Vec::new();
        tcp.write_to(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_deep_clone_copies_storage() {
        let registry = default_registry();
        let eth = Frame::decode(&registry, Protocol::Ethernet, Buffer::from(tcp_over_ethernet()))
            .unwrap()
            .unwrap();
        let ip = eth.next_frame().unwrap().unwrap();
        let copy = ip.deep_clone();
        assert!(!copy.same_record(&ip));
        copy.header().set_u8(8, 1).unwrap(); // TTL
        assert_eq!(ip.header().get_u8(8).unwrap(), 64);
        assert_eq!(
            copy.next_frame().unwrap().unwrap().protocol(),
            Protocol::Tcp
        );
    }
}
