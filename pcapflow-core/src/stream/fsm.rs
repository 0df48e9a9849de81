//! TCP connection lifecycle inferred from captured segments.
//!
//! [`transition`] is a pure function over ([`TcpState`], [`TcpSegment`],
//! [`TcpFlowData`]). It is total: every state has an outcome for every
//! segment, and a segment it does not recognise leaves the state alone.

use std::fmt;

use super::flow::FlowId;
use crate::error::DecodeError;
use crate::packet::Packet;
use crate::protocol::{Protocol, TcpPacket};

/// Lifecycle state of one TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TcpState {
    #[default]
    Init,
    Handshake,
    Established,
    /// One side has sent FIN.
    FinWait1,
    /// The first FIN was acknowledged, the other side is still open.
    FinWait2,
    /// Both sides sent FIN, neither acknowledged yet.
    ClosingBoth,
    /// First FIN acknowledged, second FIN outstanding.
    ClosedOneClosingOther,
    /// Second FIN acknowledged, first FIN outstanding.
    ClosingOneClosedOther,
    Closed,
    /// The tuple was recycled by an unrelated connection. Absorbing.
    ClosedPortsReused,
}

impl TcpState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Init => "init",
            TcpState::Handshake => "handshake",
            TcpState::Established => "established",
            TcpState::FinWait1 => "fin_wait_1",
            TcpState::FinWait2 => "fin_wait_2",
            TcpState::ClosingBoth => "closing_both",
            TcpState::ClosedOneClosingOther => "closed_one_closing_other",
            TcpState::ClosingOneClosedOther => "closing_one_closed_other",
            TcpState::Closed => "closed",
            TcpState::ClosedPortsReused => "closed_ports_reused",
        }
    }

    /// `Closed` or `ClosedPortsReused`.
    pub fn is_ended(&self) -> bool {
        matches!(self, TcpState::Closed | TcpState::ClosedPortsReused)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A FIN seen on one direction of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalfClose {
    pub seq: u32,
    pub flow: FlowId,
    pub acked: bool,
}

impl HalfClose {
    fn from_segment(segment: &TcpSegment) -> Self {
        HalfClose {
            seq: segment.seq,
            flow: segment.flow,
            acked: false,
        }
    }
}

/// Per-stream memory consulted by [`transition`].
///
/// The recorded SYNs only serve to tell a retransmitted SYN apart from a
/// new connection on the same tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlowData {
    pub syn1: Option<(u32, FlowId)>,
    pub syn2: Option<(u32, FlowId)>,
    pub fin1: Option<HalfClose>,
    pub fin2: Option<HalfClose>,
}

impl TcpFlowData {
    fn is_duplicate_syn(&self, segment: &TcpSegment) -> bool {
        let key = Some((segment.seq, segment.flow));
        segment.syn && (self.syn1 == key || self.syn2 == key)
    }

    /// A SYN that is not a retransmission of a recorded one.
    fn is_new_syn(&self, segment: &TcpSegment) -> bool {
        segment.syn && !self.is_duplicate_syn(segment)
    }

    /// A FIN from the opposite direction to the first FIN.
    fn is_second_fin(&self, segment: &TcpSegment) -> bool {
        segment.fin && self.fin1.is_some_and(|fin| fin.flow != segment.flow)
    }
}

/// Does `segment` acknowledge the outstanding FIN `half`?
fn acks(half: Option<HalfClose>, segment: &TcpSegment) -> bool {
    segment.ack_flag
        && half.is_some_and(|fin| {
            !fin.acked && fin.flow == segment.flow.reversed() && seq_after(segment.ack, fin.seq)
        })
}

/// RFC 1982 serial-number comparison: is `a` strictly after `b`?
fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn mark_acked(half: &mut Option<HalfClose>) {
    if let Some(fin) = half {
        fin.acked = true;
    }
}

/// The fields of a TCP segment the state machine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub flow: FlowId,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack_flag: bool,
}

impl TcpSegment {
    /// Extract the segment from any packet of a record carrying TCP over IP.
    ///
    /// `Ok(None)` for records without TCP.
    pub fn from_packet(packet: &Packet) -> Result<Option<TcpSegment>, DecodeError> {
        let root = packet.frame().root().parse()?;
        let Some(tcp) = root.get_packet(Protocol::Tcp)? else {
            return Ok(None);
        };
        let Some(header) = tcp.downcast::<TcpPacket>() else {
            return Ok(None);
        };
        let Some(flow) = FlowId::from_transport(&tcp)? else {
            return Ok(None);
        };
        Ok(Some(TcpSegment {
            flow,
            seq: header.sequence_number(),
            ack: header.acknowledgment_number(),
            syn: header.is_syn(),
            fin: header.is_fin(),
            rst: header.is_rst(),
            ack_flag: header.is_ack(),
        }))
    }
}

/// Next state and flow memory after `segment`.
pub fn transition(
    state: TcpState,
    segment: &TcpSegment,
    data: TcpFlowData,
) -> (TcpState, TcpFlowData) {
    use TcpState::*;

    let mut data = data;

    if state == ClosedPortsReused {
        return (state, data);
    }
    if segment.rst && state != Closed {
        return (Closed, data);
    }
    // A retransmitted SYN is neither recorded again nor taken for a new
    // connection; its other flags still count.
    let duplicate_syn = data.is_duplicate_syn(segment);

    let next = match state {
        Init => {
            if segment.syn {
                if !duplicate_syn {
                    data.syn1 = Some((segment.seq, segment.flow));
                }
                Handshake
            } else if segment.fin {
                data.fin1 = Some(HalfClose::from_segment(segment));
                FinWait1
            } else {
                Established
            }
        }
        Handshake => {
            if segment.syn {
                if !duplicate_syn {
                    data.syn2 = Some((segment.seq, segment.flow));
                }
                Handshake
            } else if segment.fin {
                data.fin1 = Some(HalfClose::from_segment(segment));
                FinWait1
            } else {
                Established
            }
        }
        _ if data.is_new_syn(segment) => ClosedPortsReused,
        Established => {
            if segment.fin {
                data.fin1 = Some(HalfClose::from_segment(segment));
                FinWait1
            } else {
                Established
            }
        }
        FinWait1 => {
            let acked = acks(data.fin1, segment);
            let second = data.is_second_fin(segment);
            if acked {
                mark_acked(&mut data.fin1);
            }
            if second {
                data.fin2 = Some(HalfClose::from_segment(segment));
            }
            match (acked, second) {
                (true, true) => ClosedOneClosingOther,
                (true, false) => FinWait2,
                (false, true) => ClosingBoth,
                (false, false) => FinWait1,
            }
        }
        FinWait2 => {
            if data.is_second_fin(segment) {
                data.fin2 = Some(HalfClose::from_segment(segment));
                ClosedOneClosingOther
            } else {
                FinWait2
            }
        }
        ClosingBoth => {
            if acks(data.fin1, segment) {
                mark_acked(&mut data.fin1);
                ClosedOneClosingOther
            } else if acks(data.fin2, segment) {
                mark_acked(&mut data.fin2);
                ClosingOneClosedOther
            } else {
                ClosingBoth
            }
        }
        ClosedOneClosingOther => {
            if acks(data.fin2, segment) {
                mark_acked(&mut data.fin2);
                Closed
            } else {
                ClosedOneClosingOther
            }
        }
        ClosingOneClosedOther => {
            if acks(data.fin1, segment) {
                mark_acked(&mut data.fin1);
                Closed
            } else {
                ClosingOneClosedOther
            }
        }
        Closed => Closed,
        ClosedPortsReused => ClosedPortsReused,
    };

    (next, data)
}
