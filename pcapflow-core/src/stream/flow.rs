//! Direction-sensitive transport flow identifiers.

use std::fmt;
use std::net::IpAddr;

use crate::error::DecodeError;
use crate::packet::Packet;
use crate::protocol::{Ipv4Packet, Ipv6Packet, Layer, Protocol, SctpPacket, TcpPacket, UdpPacket};

/// Transport protocol plus both endpoints, source first.
///
/// Equality is direction-sensitive: a flow is not equal to its
/// [`reversed`](FlowId::reversed) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    protocol: Protocol,
    source: IpAddr,
    source_port: u16,
    destination: IpAddr,
    destination_port: u16,
}

impl FlowId {
    pub fn new(
        protocol: Protocol,
        source: IpAddr,
        source_port: u16,
        destination: IpAddr,
        destination_port: u16,
    ) -> Self {
        FlowId {
            protocol,
            source,
            source_port,
            destination,
            destination_port,
        }
    }

    /// Flow of the first transport layer in the record `packet` belongs to.
    ///
    /// `Ok(None)` when the record carries no TCP, UDP or SCTP over IP.
    pub fn of(packet: &Packet) -> Result<Option<FlowId>, DecodeError> {
        let mut frame = Some(packet.frame().root());
        while let Some(current) = frame {
            if current.layer() == Layer::Transport {
                return Self::from_transport(&current.parse()?);
            }
            frame = current.next_frame()?;
        }
        Ok(None)
    }

    /// Flow of a transport packet, addressed by its enclosing IP packet.
    pub fn from_transport(transport: &Packet) -> Result<Option<FlowId>, DecodeError> {
        let ports = if let Some(tcp) = transport.downcast::<TcpPacket>() {
            (tcp.source_port(), tcp.destination_port())
        } else if let Some(udp) = transport.downcast::<UdpPacket>() {
            (udp.source_port(), udp.destination_port())
        } else if let Some(sctp) = transport.downcast::<SctpPacket>() {
            (sctp.source_port(), sctp.destination_port())
        } else {
            return Ok(None);
        };

        let Some(ip) = transport.parent_packet()? else {
            return Ok(None);
        };
        let addresses = if let Some(v4) = ip.downcast::<Ipv4Packet>() {
            (IpAddr::V4(v4.source()), IpAddr::V4(v4.destination()))
        } else if let Some(v6) = ip.downcast::<Ipv6Packet>() {
            (IpAddr::V6(v6.source()), IpAddr::V6(v6.destination()))
        } else {
            return Ok(None);
        };

        Ok(Some(FlowId::new(
            transport.protocol(),
            addresses.0,
            ports.0,
            addresses.1,
            ports.1,
        )))
    }

    /// The same flow seen from the other endpoint.
    pub fn reversed(&self) -> FlowId {
        FlowId {
            protocol: self.protocol,
            source: self.destination,
            source_port: self.destination_port,
            destination: self.source,
            destination_port: self.source_port,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = |f: &mut fmt::Formatter<'_>, addr: IpAddr, port: u16| match addr {
            IpAddr::V4(v4) => write!(f, "{v4}:{port}"),
            IpAddr::V6(v6) => write!(f, "[{v6}]:{port}"),
        };
        write!(f, "{} ", self.protocol)?;
        endpoint(f, self.source, self.source_port)?;
        f.write_str(" -> ")?;
        endpoint(f, self.destination, self.destination_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::frame::Frame;
    use crate::protocol::default_registry;
    use crate::protocol::test_utils::{EthernetBuilder, Ipv4Builder, Ipv6Builder, TcpBuilder, UdpBuilder};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn root(bytes: Vec<u8>) -> Packet {
        Frame::decode(&default_registry(), Protocol::Ethernet, Buffer::from(bytes))
            .unwrap()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_tcp_flow_over_ipv4() {
        let packet = root(
            EthernetBuilder::new()
                .payload(
                    Ipv4Builder::new()
                        .src_ip([10, 0, 0, 1])
                        .dst_ip([10, 0, 0, 2])
                        .payload(TcpBuilder::new().src_port(40000).dst_port(443).build())
                        .build(),
                )
                .build(),
        );

        let flow = FlowId::of(&packet).unwrap().unwrap();
        assert_eq!(flow.protocol(), Protocol::Tcp);
        assert_eq!(flow.source(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(flow.source_port(), 40000);
        assert_eq!(flow.destination_port(), 443);
        assert_eq!(flow.to_string(), "tcp 10.0.0.1:40000 -> 10.0.0.2:443");

        // Asking from the transport packet itself gives the same flow
        let tcp = packet.get_packet(Protocol::Tcp).unwrap().unwrap();
        assert_eq!(FlowId::from_transport(&tcp).unwrap(), Some(flow));
    }

    #[test]
    fn test_reversed_is_direction_sensitive() {
        let a = FlowId::new(
            Protocol::Udp,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            5060,
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)),
            5061,
        );
        let b = a.reversed();
        assert_ne!(a, b);
        assert_eq!(b.source_port(), 5061);
        assert_eq!(b.reversed(), a);
    }

    #[test]
    fn test_udp_flow_over_ipv6() {
        let packet = root(
            EthernetBuilder::new()
                .ipv6()
                .payload(
                    Ipv6Builder::new()
                        .next_header(17)
                        .payload(UdpBuilder::new().src_port(5060).build())
                        .build(),
                )
                .build(),
        );
        let flow = FlowId::of(&packet).unwrap().unwrap();
        assert_eq!(flow.protocol(), Protocol::Udp);
        assert_eq!(
            flow.source(),
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))
        );
        assert_eq!(flow.source_port(), 5060);
    }

    #[test]
    fn test_no_transport_layer() {
        let packet = root(
            EthernetBuilder::new()
                .payload(Ipv4Builder::new().protocol(1).payload(vec![8, 0, 0, 0]).build())
                .build(),
        );
        assert_eq!(FlowId::of(&packet).unwrap(), None);
    }
}
