//! Groups TCP segments into streams and drives each stream's state machine.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use tracing::{debug, warn};

use super::flow::FlowId;
use super::fsm::{transition, TcpFlowData, TcpSegment, TcpState};
use crate::error::{DecodeError, Result, UsageError};
use crate::packet::Packet;
use crate::pcap::PcapWriter;
use crate::protocol::{Ipv4Packet, Ipv6Packet, Protocol};

/// Stream handler configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Retain every packet on its stream.
    pub keep_packets: bool,
    /// Upper bound on streams held by the handler. When exceeded the oldest
    /// finished stream is dropped, or the oldest open one if none finished.
    pub max_tracked_streams: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keep_packets: true,
            max_tracked_streams: None,
        }
    }
}

/// Callbacks fired by [`TcpStreamHandler`] in capture order.
pub trait StreamListener {
    /// A segment opened a new stream. No `packet_received` follows for it.
    fn stream_started(&mut self, _stream: &TcpStream, _packet: &Packet) {}

    /// A segment was added to an existing stream.
    fn packet_received(&mut self, _stream: &TcpStream, _packet: &Packet) {}

    /// Fired once per stream.
    fn stream_ended(&mut self, _stream: &TcpStream) {}
}

/// Takes fragmented IP packets before they reach stream tracking.
///
/// Only whole segments are tracked. An implementation that reassembles
/// returns the rebuilt packet once it has every fragment, and `None` while
/// it is still waiting.
pub trait FragmentListener {
    /// `ip` is the IPv4 or IPv6 packet of a fragmented record.
    fn fragment_received(&mut self, ip: &Packet) -> Option<Packet>;
}

/// One TCP connection as seen in the capture.
#[derive(Debug, Clone)]
pub struct TcpStream {
    id: u64,
    flow: FlowId,
    state: TcpState,
    data: TcpFlowData,
    first_arrival: i64,
    last_arrival: i64,
    packet_count: u64,
    packets: Vec<Packet>,
    end_reported: bool,
}

impl TcpStream {
    fn new(id: u64, segment: &TcpSegment, packet: &Packet, keep_packets: bool) -> Self {
        let (state, data) = transition(TcpState::Init, segment, TcpFlowData::default());
        let arrival = packet.arrival_time();
        TcpStream {
            id,
            flow: segment.flow,
            state,
            data,
            first_arrival: arrival,
            last_arrival: arrival,
            packet_count: 1,
            packets: if keep_packets {
                vec![packet.clone()]
            } else {
                Vec::new()
            },
            end_reported: false,
        }
    }

    fn add(&mut self, packet: &Packet, keep_packets: bool) {
        self.last_arrival = packet.arrival_time();
        self.packet_count += 1;
        if keep_packets {
            self.packets.push(packet.clone());
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flow of the segment that opened the stream.
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn flow_data(&self) -> &TcpFlowData {
        &self.data
    }

    /// Arrival time of the first segment, microseconds since the epoch.
    pub fn first_arrival(&self) -> i64 {
        self.first_arrival
    }

    pub fn last_arrival(&self) -> i64 {
        self.last_arrival
    }

    pub fn duration_us(&self) -> i64 {
        self.last_arrival - self.first_arrival
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Packets of the stream in capture order. Empty unless
    /// [`StreamConfig::keep_packets`] is set.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Reached `Closed` or `ClosedPortsReused`.
    pub fn is_ended(&self) -> bool {
        self.state.is_ended()
    }

    /// Write the stream's packets to `writer` in capture order.
    ///
    /// Fails with [`UsageError::PacketsNotRetained`] when the stream saw
    /// packets but [`StreamConfig::keep_packets`] was off.
    pub fn write_to<W: Write>(&self, writer: &mut PcapWriter<W>) -> Result<()> {
        if self.packets.is_empty() && self.packet_count > 0 {
            return Err(UsageError::PacketsNotRetained(self.id).into());
        }
        for packet in &self.packets {
            writer.write_packet(packet)?;
        }
        Ok(())
    }
}

/// Tracks TCP streams across a capture.
///
/// A connection is one stream whichever direction its first segment went:
/// lookups try the flow and its reverse. Finished streams keep receiving
/// retransmissions until a new SYN recycles the tuple, at which point the
/// old stream ends and the SYN opens a fresh one.
pub struct TcpStreamHandler {
    config: StreamConfig,
    listeners: Vec<Box<dyn StreamListener>>,
    fragment_listener: Option<Box<dyn FragmentListener>>,
    /// Current stream per flow, keyed by the flow that opened it.
    active: HashMap<FlowId, u64>,
    /// All streams by id, which is also creation order.
    streams: BTreeMap<u64, TcpStream>,
    next_id: u64,
}

impl TcpStreamHandler {
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            fragment_listener: None,
            active: HashMap::new(),
            streams: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn StreamListener>) {
        self.listeners.push(listener);
    }

    /// Hand fragmented IP packets to `listener`. Without one they are
    /// dropped.
    pub fn set_fragment_listener(&mut self, listener: Box<dyn FragmentListener>) {
        self.fragment_listener = Some(listener);
    }

    /// Feed one record. Any packet of the record will do; the TCP layer is
    /// located from the root.
    ///
    /// Fragmented IP records go to the [`FragmentListener`] first, and only a
    /// packet it hands back is tracked.
    ///
    /// Returns `false` for records without TCP over IP, for fragments still
    /// awaiting reassembly, and for records whose decode failed (logged and
    /// dropped).
    pub fn process(&mut self, packet: &Packet) -> bool {
        let ip = match fragmented_ip(packet) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(
                    frame_number = packet.record_info().frame_number,
                    error = %e,
                    "dropping record from stream tracking"
                );
                return false;
            }
        };
        let Some(ip) = ip else {
            return self.track(packet);
        };

        let whole = self
            .fragment_listener
            .as_mut()
            .and_then(|listener| listener.fragment_received(&ip));
        match whole {
            Some(whole) => self.track(&whole),
            None => {
                debug!(
                    frame_number = packet.record_info().frame_number,
                    "ip fragment not tracked"
                );
                false
            }
        }
    }

    fn track(&mut self, packet: &Packet) -> bool {
        let segment = match TcpSegment::from_packet(packet) {
            Ok(Some(segment)) => segment,
            Ok(None) => return false,
            Err(e) => {
                warn!(
                    frame_number = packet.record_info().frame_number,
                    error = %e,
                    "dropping record from stream tracking"
                );
                return false;
            }
        };

        let key = if self.active.contains_key(&segment.flow) {
            Some(segment.flow)
        } else {
            let reverse = segment.flow.reversed();
            self.active.contains_key(&reverse).then_some(reverse)
        };
        let existing = key.and_then(|k| self.active.get(&k).copied());

        let Some(stream) = existing.and_then(|id| self.streams.get_mut(&id)) else {
            self.start_stream(&segment, packet);
            return true;
        };

        let (state, data) = transition(stream.state, &segment, stream.data);
        stream.state = state;
        stream.data = data;

        if state == TcpState::ClosedPortsReused {
            debug!(stream = stream.id, flow = %segment.flow, "tcp ports reused, restarting stream");
            report_end(&mut self.listeners, stream);
            if let Some(k) = key {
                self.active.remove(&k);
            }
            self.start_stream(&segment, packet);
            return true;
        }

        stream.add(packet, self.config.keep_packets);
        for listener in &mut self.listeners {
            listener.packet_received(stream, packet);
        }
        if stream.is_ended() {
            report_end(&mut self.listeners, stream);
        }
        true
    }

    /// End of capture: report every stream that has not ended yet.
    pub fn finish(&mut self) {
        for stream in self.streams.values_mut() {
            report_end(&mut self.listeners, stream);
        }
    }

    /// Streams in creation order, including finished ones.
    pub fn streams(&self) -> impl Iterator<Item = &TcpStream> {
        self.streams.values()
    }

    pub fn stream(&self, id: u64) -> Option<&TcpStream> {
        self.streams.get(&id)
    }

    /// The current stream for `flow` in either direction.
    pub fn find(&self, flow: &FlowId) -> Option<&TcpStream> {
        self.active
            .get(flow)
            .or_else(|| self.active.get(&flow.reversed()))
            .and_then(|id| self.streams.get(id))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn into_streams(self) -> Vec<TcpStream> {
        self.streams.into_values().collect()
    }

    fn start_stream(&mut self, segment: &TcpSegment, packet: &Packet) {
        let id = self.next_id;
        self.next_id += 1;

        let stream = TcpStream::new(id, segment, packet, self.config.keep_packets);
        debug!(stream = id, flow = %segment.flow, state = %stream.state, "tcp stream started");
        for listener in &mut self.listeners {
            listener.stream_started(&stream, packet);
        }

        let mut stream = stream;
        if stream.is_ended() {
            report_end(&mut self.listeners, &mut stream);
        }
        self.active.insert(segment.flow, id);
        self.streams.insert(id, stream);
        self.evict();
    }

    fn evict(&mut self) {
        let Some(max) = self.config.max_tracked_streams else {
            return;
        };
        while self.streams.len() > max {
            let victim = self
                .streams
                .values()
                .find(|s| s.end_reported)
                .or_else(|| self.streams.values().next())
                .map(|s| s.id);
            let Some(id) = victim else {
                return;
            };
            if let Some(mut stream) = self.streams.remove(&id) {
                report_end(&mut self.listeners, &mut stream);
                self.active.retain(|_, active| *active != id);
                debug!(stream = id, "evicted tcp stream");
            }
        }
    }
}

impl Default for TcpStreamHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// The IP packet of `packet`'s record, if that packet is a fragment.
fn fragmented_ip(packet: &Packet) -> std::result::Result<Option<Packet>, DecodeError> {
    let root = packet.frame().root().parse()?;
    for protocol in [Protocol::Ipv4, Protocol::Ipv6] {
        let Some(ip) = root.get_packet(protocol)? else {
            continue;
        };
        let fragmented = ip
            .downcast::<Ipv4Packet>()
            .map(Ipv4Packet::is_fragment)
            .or_else(|| ip.downcast::<Ipv6Packet>().map(Ipv6Packet::is_fragment))
            .unwrap_or(false);
        return Ok(fragmented.then_some(ip));
    }
    Ok(None)
}

fn report_end(listeners: &mut [Box<dyn StreamListener>], stream: &mut TcpStream) {
    if stream.end_reported {
        return;
    }
    stream.end_reported = true;
    debug!(
        stream = stream.id,
        state = %stream.state,
        packets = stream.packet_count,
        "tcp stream ended"
    );
    for listener in listeners.iter_mut() {
        listener.stream_ended(stream);
    }
}
