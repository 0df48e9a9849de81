//! Protocol identifiers and the decoders that frame them.
//!
//! Every decoder implements [`Decoder`]: a cheap `accept` sniff and a `frame`
//! step that cuts one layer's header off a [`Buffer`](crate::Buffer). Decoders
//! are collected in a [`DecoderRegistry`], which the frame chain consults
//! whenever a layer asks for its successor.

mod application;
mod ethernet;
mod ipv4;
mod ipv6;
mod linux_sll;
mod pcap;
mod registry;
mod rtp;
mod sctp;
mod tcp;
mod udp;

#[cfg(test)]
pub(crate) mod test_utils;

use std::fmt;

pub use application::{ApplicationDecoder, ApplicationPacket};
pub use ethernet::{EthernetDecoder, EthernetPacket};
pub use ipv4::{Ipv4Decoder, Ipv4Packet};
pub use ipv6::{Ipv6Decoder, Ipv6Packet};
pub use linux_sll::{SllDecoder, SllPacket};
pub use pcap::{PcapDecoder, PcapPacket};
pub use registry::{default_registry, Decoder, DecoderRegistry, Framed, NextLayer, RegistryBuilder};
pub use rtp::{RtpDecoder, RtpPacket};
pub use sctp::{SctpChunk, SctpDecoder, SctpPacket};
pub use tcp::{TcpDecoder, TcpFlags, TcpPacket};
pub use udp::{UdpDecoder, UdpPacket};

/// OSI-style layer a protocol lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    /// The capture record itself
    Physical,
    Link,
    Network,
    Transport,
    Application,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Physical => "physical",
            Layer::Link => "link",
            Layer::Network => "network",
            Layer::Transport => "transport",
            Layer::Application => "application",
        };
        f.write_str(name)
    }
}

/// Protocol identifiers known to the decoder chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Pcap,
    Ethernet,
    Sll,
    Arp,
    Ipv4,
    Ipv6,
    Icmp,
    Icmpv6,
    Igmp,
    Tcp,
    Udp,
    Sctp,
    Sip,
    Sdp,
    Rtp,
    Rtcp,
    Diameter,
    Gtp,
}

/// EtherType values the link decoders follow.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86DD;
}

/// Link types from the capture global header.
pub mod link_type {
    pub const ETHERNET: u32 = 1;
    pub const RAW: u32 = 101;
    pub const LINUX_SLL: u32 = 113;
    pub const IPV4: u32 = 228;
    pub const IPV6: u32 = 229;
}

impl Protocol {
    /// Every identifier, in declaration order.
    pub const ALL: [Protocol; 18] = [
        Protocol::Pcap,
        Protocol::Ethernet,
        Protocol::Sll,
        Protocol::Arp,
        Protocol::Ipv4,
        Protocol::Ipv6,
        Protocol::Icmp,
        Protocol::Icmpv6,
        Protocol::Igmp,
        Protocol::Tcp,
        Protocol::Udp,
        Protocol::Sctp,
        Protocol::Sip,
        Protocol::Sdp,
        Protocol::Rtp,
        Protocol::Rtcp,
        Protocol::Diameter,
        Protocol::Gtp,
    ];

    pub fn layer(self) -> Layer {
        match self {
            Protocol::Pcap => Layer::Physical,
            Protocol::Ethernet | Protocol::Sll | Protocol::Arp => Layer::Link,
            Protocol::Ipv4
            | Protocol::Ipv6
            | Protocol::Icmp
            | Protocol::Icmpv6
            | Protocol::Igmp => Layer::Network,
            Protocol::Tcp | Protocol::Udp | Protocol::Sctp => Layer::Transport,
            Protocol::Sip
            | Protocol::Sdp
            | Protocol::Rtp
            | Protocol::Rtcp
            | Protocol::Diameter
            | Protocol::Gtp => Layer::Application,
        }
    }

    /// Short lowercase name, as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Pcap => "pcap",
            Protocol::Ethernet => "eth",
            Protocol::Sll => "sll",
            Protocol::Arp => "arp",
            Protocol::Ipv4 => "ipv4",
            Protocol::Ipv6 => "ipv6",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "icmpv6",
            Protocol::Igmp => "igmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::Sip => "sip",
            Protocol::Sdp => "sdp",
            Protocol::Rtp => "rtp",
            Protocol::Rtcp => "rtcp",
            Protocol::Diameter => "diameter",
            Protocol::Gtp => "gtp",
        }
    }

    /// Protocol carried in an IPv4 protocol / IPv6 next-header field.
    pub fn from_ip_number(number: u8) -> Option<Protocol> {
        match number {
            1 => Some(Protocol::Icmp),
            2 => Some(Protocol::Igmp),
            4 => Some(Protocol::Ipv4),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            41 => Some(Protocol::Ipv6),
            58 => Some(Protocol::Icmpv6),
            132 => Some(Protocol::Sctp),
            _ => None,
        }
    }

    pub fn from_ethertype(ethertype: u16) -> Option<Protocol> {
        match ethertype {
            ethertype::IPV4 => Some(Protocol::Ipv4),
            ethertype::IPV6 => Some(Protocol::Ipv6),
            ethertype::ARP => Some(Protocol::Arp),
            _ => None,
        }
    }

    /// What the first layer inside a record of `link_type` is.
    ///
    /// Raw IP captures return the network layer, leaving IPv4/IPv6 to be
    /// told apart by sniffing.
    pub fn next_for_link_type(link_type: u32) -> Option<NextLayer> {
        match link_type {
            link_type::ETHERNET => Some(NextLayer::Protocol(Protocol::Ethernet)),
            link_type::LINUX_SLL => Some(NextLayer::Protocol(Protocol::Sll)),
            link_type::RAW => Some(NextLayer::Layer(Layer::Network)),
            link_type::IPV4 => Some(NextLayer::Protocol(Protocol::Ipv4)),
            link_type::IPV6 => Some(NextLayer::Protocol(Protocol::Ipv6)),
            _ => None,
        }
    }

    /// Link type to record in a capture whose records start with `self`.
    pub fn link_type(self) -> Option<u32> {
        match self {
            Protocol::Ethernet => Some(link_type::ETHERNET),
            Protocol::Sll => Some(link_type::LINUX_SLL),
            Protocol::Ipv4 | Protocol::Ipv6 => Some(link_type::RAW),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
