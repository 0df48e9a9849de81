//! Synthetic capture builders shared by the integration tests.

#![allow(dead_code)]

use tracing_subscriber::EnvFilter;

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];
pub const CLIENT_PORT: u16 = 49152;
pub const SERVER_PORT: u16 = 80;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

/// Routes library logs to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

/// Ethernet II header carrying IPv4.
fn ethernet(packet: &mut Vec<u8>) {
    packet.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // dst MAC
    packet.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]); // src MAC
    packet.extend_from_slice(&[0x08, 0x00]); // ethertype: IPv4
}

fn ipv4(packet: &mut Vec<u8>, protocol: u8, src: [u8; 4], dst: [u8; 4], payload_len: usize) {
    let start = packet.len();
    packet.push(0x45); // Version 4, IHL 5
    packet.push(0x00); // DSCP + ECN
    packet.extend_from_slice(&((20 + payload_len) as u16).to_be_bytes()); // Total length
    packet.extend_from_slice(&[0x00, 0x01]); // Identification
    packet.extend_from_slice(&[0x40, 0x00]); // Don't fragment
    packet.push(64); // TTL
    packet.push(protocol); // Protocol
    packet.extend_from_slice(&[0x00, 0x00]); // Checksum, filled below
    packet.extend_from_slice(&src); // Src IP
    packet.extend_from_slice(&dst); // Dst IP

    let checksum = checksum(&packet[start..start + 20]);
    packet[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
}

fn checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Ethernet/IPv4/TCP segment between the client and the server.
pub fn tcp_segment(from_client: bool, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let (src, dst, sport, dport) = if from_client {
        (CLIENT, SERVER, CLIENT_PORT, SERVER_PORT)
    } else {
        (SERVER, CLIENT, SERVER_PORT, CLIENT_PORT)
    };
    tcp_between(src, dst, sport, dport, seq, ack, flags, payload)
}

#[allow(clippy::too_many_arguments)]
pub fn tcp_between(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::new();
    ethernet(&mut packet);
    ipv4(&mut packet, 6, src, dst, 20 + payload.len());

    packet.extend_from_slice(&sport.to_be_bytes()); // Src port
    packet.extend_from_slice(&dport.to_be_bytes()); // Dst port
    packet.extend_from_slice(&seq.to_be_bytes()); // Seq
    packet.extend_from_slice(&ack.to_be_bytes()); // Ack
    packet.push(0x50); // Data offset: 5 (20 bytes)
    packet.push(flags); // Flags
    packet.extend_from_slice(&[0xff, 0xff]); // Window: 65535
    packet.extend_from_slice(&[0x00, 0x00]); // Checksum
    packet.extend_from_slice(&[0x00, 0x00]); // Urgent pointer
    packet.extend_from_slice(payload);
    packet
}

/// Splits an Ethernet/IPv4 packet in two IP fragments, the first carrying
/// `split` bytes of the IP payload. `split` must be a multiple of 8.
pub fn fragments(packet: &[u8], split: usize) -> [Vec<u8>; 2] {
    let (headers, payload) = packet.split_at(14 + 20);
    let (first, second) = payload.split_at(split);
    [(first, 0u16, true), (second, (split / 8) as u16, false)].map(|(part, offset, more)| {
        let mut fragment = headers.to_vec();
        let flags = if more { 0x2000 } else { 0 }; // More fragments
        fragment[16..18].copy_from_slice(&((20 + part.len()) as u16).to_be_bytes()); // Total length
        fragment[20..22].copy_from_slice(&(flags | offset).to_be_bytes()); // Flags, offset
        fragment[24..26].copy_from_slice(&[0x00, 0x00]);
        let checksum = checksum(&fragment[14..34]);
        fragment[24..26].copy_from_slice(&checksum.to_be_bytes());
        fragment.extend_from_slice(part);
        fragment
    })
}

/// Ethernet/IPv4/UDP datagram from the client.
pub fn udp_datagram(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::new();
    ethernet(&mut packet);
    ipv4(&mut packet, 17, CLIENT, SERVER, 8 + payload.len());

    packet.extend_from_slice(&sport.to_be_bytes()); // Src port
    packet.extend_from_slice(&dport.to_be_bytes()); // Dst port
    packet.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes()); // Length
    packet.extend_from_slice(&[0x00, 0x00]); // Checksum (none)
    packet.extend_from_slice(payload);
    packet
}

/// Little-endian microsecond PCAP with Ethernet link type, one record per
/// packet, one millisecond apart.
pub fn pcap_file(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut data = Vec::new();

    // PCAP global header
    data.extend_from_slice(&[0xd4, 0xc3, 0xb2, 0xa1]); // Magic (little endian)
    data.extend_from_slice(&[0x02, 0x00]); // Version major (2)
    data.extend_from_slice(&[0x04, 0x00]); // Version minor (4)
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // Thiszone
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // Sigfigs
    data.extend_from_slice(&[0xff, 0xff, 0x00, 0x00]); // Snaplen (65535)
    data.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]); // Network: Ethernet

    for (i, packet) in packets.iter().enumerate() {
        let ts_usec = (i as u32) * 1000;
        data.extend_from_slice(&1_700_000_000u32.to_le_bytes()); // ts_sec
        data.extend_from_slice(&ts_usec.to_le_bytes()); // ts_usec
        data.extend_from_slice(&(packet.len() as u32).to_le_bytes()); // Captured length
        data.extend_from_slice(&(packet.len() as u32).to_le_bytes()); // Original length
        data.extend_from_slice(packet);
    }
    data
}

/// Full client/server exchange: handshake, one request and response, then
/// an orderly close initiated by the client.
pub fn http_conversation() -> Vec<Vec<u8>> {
    let request = b"GET / HTTP/1.1\r\nHost: example\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    let c_data = 1001;
    let s_data = 5001;
    let c_fin = c_data + request.len() as u32;
    let s_fin = s_data + response.len() as u32;

    vec![
        tcp_segment(true, 1000, 0, SYN, &[]),
        tcp_segment(false, 5000, 1001, SYN | ACK, &[]),
        tcp_segment(true, c_data, s_data, ACK, &[]),
        tcp_segment(true, c_data, s_data, PSH | ACK, request),
        tcp_segment(false, s_data, c_fin, PSH | ACK, response),
        tcp_segment(true, c_fin, s_fin, FIN | ACK, &[]),
        tcp_segment(false, s_fin, c_fin + 1, ACK, &[]),
        tcp_segment(false, s_fin, c_fin + 1, FIN | ACK, &[]),
        tcp_segment(true, c_fin + 1, s_fin + 1, ACK, &[]),
    ]
}
