//! Packet builders for decoder tests.
//!
//! Each builder starts from a complete default header and patches fields in
//! place; lengths and the IPv4 checksum are filled in by `build`.

#[derive(Debug, Clone)]
pub struct EthernetBuilder {
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl EthernetBuilder {
    pub fn new() -> Self {
        let mut header = Vec::with_capacity(18);
        header.extend_from_slice(&[0xff; 6]); // destination: broadcast
        header.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // source
        header.extend_from_slice(&[0x08, 0x00]); // IPv4
        EthernetBuilder {
            header,
            payload: Vec::new(),
        }
    }

    pub fn ethertype(mut self, ethertype: u16) -> Self {
        let at = self.header.len() - 2;
        self.header[at..].copy_from_slice(&ethertype.to_be_bytes());
        self
    }

    pub fn ipv6(self) -> Self {
        self.ethertype(0x86dd)
    }

    /// Insert an 802.1Q tag carrying `id` ahead of the EtherType.
    pub fn vlan(mut self, id: u16) -> Self {
        let [hi, lo] = id.to_be_bytes();
        self.header.splice(12..12, [0x81, 0x00, hi, lo]);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        [self.header, self.payload].concat()
    }
}

/// IPv4 with a 20-byte header.
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    header: [u8; 20],
    payload: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Ipv4Builder {
            header: [
                0x45, 0x00, 0x00, 0x00, // version 4, IHL 5, DSCP, total length
                0x00, 0x01, 0x40, 0x00, // identification, DF
                64, 6, 0x00, 0x00, // TTL, TCP, checksum
                192, 168, 1, 1, // source
                192, 168, 1, 2, // destination
            ],
            payload: Vec::new(),
        }
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.header[9] = protocol;
        self
    }

    pub fn udp(self) -> Self {
        self.protocol(17)
    }

    /// Fragment offset in 8-byte units; clears DF.
    pub fn fragment_offset(mut self, offset: u16) -> Self {
        self.header[6..8].copy_from_slice(&(offset & 0x1fff).to_be_bytes());
        self
    }

    pub fn src_ip(mut self, ip: [u8; 4]) -> Self {
        self.header[12..16].copy_from_slice(&ip);
        self
    }

    pub fn dst_ip(mut self, ip: [u8; 4]) -> Self {
        self.header[16..20].copy_from_slice(&ip);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let total = (self.header.len() + self.payload.len()) as u16;
        self.header[2..4].copy_from_slice(&total.to_be_bytes());
        let checksum = ones_complement(&self.header);
        self.header[10..12].copy_from_slice(&checksum.to_be_bytes());
        [&self.header[..], &self.payload].concat()
    }
}

fn ones_complement(bytes: &[u8]) -> u16 {
    let mut sum = bytes
        .chunks(2)
        .fold(0u32, |acc, pair| match *pair {
            [hi, lo] => acc + u32::from(u16::from_be_bytes([hi, lo])),
            [hi] => acc + (u32::from(hi) << 8),
            _ => acc,
        });
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// IPv6 from 2001:db8::1 to 2001:db8::2, optionally with 8-byte
/// extension headers between the fixed header and the payload.
#[derive(Debug, Clone)]
pub struct Ipv6Builder {
    next_header: u8,
    chain: Vec<u8>,
    payload: Vec<u8>,
}

impl Ipv6Builder {
    pub fn new() -> Self {
        Ipv6Builder {
            next_header: 6,
            chain: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Protocol after the last extension header.
    pub fn next_header(mut self, next_header: u8) -> Self {
        self.next_header = next_header;
        self
    }

    /// Append an empty extension header of `kind` (0 hop-by-hop, 43 routing,
    /// 60 destination options).
    pub fn extension(mut self, kind: u8) -> Self {
        self.chain.push(kind);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut kinds = self.chain.iter().copied().chain([self.next_header]);
        let first = kinds.next().unwrap_or(self.next_header);
        let payload_length = (self.chain.len() * 8 + self.payload.len()) as u16;

        let mut packet = vec![0x60, 0x00, 0x00, 0x00]; // version 6
        packet.extend_from_slice(&payload_length.to_be_bytes());
        packet.extend_from_slice(&[first, 64]); // next header, hop limit
        for last in [1u8, 2] {
            packet.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8]);
            packet.extend_from_slice(&[0; 11]);
            packet.push(last);
        }
        for next in kinds {
            // length 0 means one 8-byte unit
            packet.extend_from_slice(&[next, 0, 0, 0, 0, 0, 0, 0]);
        }
        packet.extend_from_slice(&self.payload);
        packet
    }
}

/// TCP from port 12345 to 80, SYN by default.
#[derive(Debug, Clone)]
pub struct TcpBuilder {
    header: [u8; 20],
    options: Vec<u8>,
    payload: Vec<u8>,
}

impl TcpBuilder {
    pub fn new() -> Self {
        TcpBuilder {
            header: [
                0x30, 0x39, 0x00, 0x50, // ports 12345 -> 80
                0x00, 0x00, 0x00, 0x01, // sequence
                0x00, 0x00, 0x00, 0x00, // acknowledgment
                0x50, 0x02, 0xff, 0xff, // data offset 5, SYN, window
                0x00, 0x00, 0x00, 0x00, // checksum, urgent pointer
            ],
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.header[0..2].copy_from_slice(&port.to_be_bytes());
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.header[2..4].copy_from_slice(&port.to_be_bytes());
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.header[4..8].copy_from_slice(&seq.to_be_bytes());
        self
    }

    pub fn ack_num(mut self, ack: u32) -> Self {
        self.header[8..12].copy_from_slice(&ack.to_be_bytes());
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.header[13] = flags;
        self
    }

    /// Raw option bytes, a multiple of 4 long.
    pub fn options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let words = (self.header.len() + self.options.len()) / 4;
        self.header[12] = (words as u8) << 4;
        [&self.header[..], &self.options, &self.payload].concat()
    }
}

/// UDP from port 12345 to 5060.
#[derive(Debug, Clone)]
pub struct UdpBuilder {
    src_port: u16,
    payload: Vec<u8>,
}

impl UdpBuilder {
    pub fn new() -> Self {
        UdpBuilder {
            src_port: 12345,
            payload: Vec::new(),
        }
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let length = (8 + self.payload.len()) as u16;
        let mut datagram = Vec::with_capacity(length as usize);
        datagram.extend_from_slice(&self.src_port.to_be_bytes());
        datagram.extend_from_slice(&5060u16.to_be_bytes());
        datagram.extend_from_slice(&length.to_be_bytes());
        datagram.extend_from_slice(&[0x00, 0x00]); // no checksum
        datagram.extend_from_slice(&self.payload);
        datagram
    }
}

/// RTP packet: PCMU, marker clear, timestamp 160, SSRC 0x12345678.
pub fn rtp_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x80, 0x00]; // V=2, PT=0
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&160u32.to_be_bytes());
    packet.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Little-endian microsecond capture holding `records` as
/// (seconds, microseconds, bytes).
pub fn pcap_file(link_type: u32, records: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut file = vec![
        0xd4, 0xc3, 0xb2, 0xa1, // magic
        0x02, 0x00, 0x04, 0x00, // version 2.4
        0x00, 0x00, 0x00, 0x00, // thiszone
        0x00, 0x00, 0x00, 0x00, // sigfigs
        0xff, 0xff, 0x00, 0x00, // snaplen
    ];
    file.extend_from_slice(&link_type.to_le_bytes());
    for (sec, usec, bytes) in records {
        file.extend(pcap_record(*sec, *usec, bytes));
    }
    file
}

/// Record header plus `packet`, captured whole.
pub fn pcap_record(sec: u32, usec: u32, packet: &[u8]) -> Vec<u8> {
    let len = (packet.len() as u32).to_le_bytes();
    [
        &sec.to_le_bytes()[..],
        &usec.to_le_bytes(),
        &len,
        &len,
        packet,
    ]
    .concat()
}
