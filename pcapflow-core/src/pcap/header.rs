//! Legacy PCAP global and record headers.

/// Byte order a capture file was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    fn put_u16(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn put_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// Resolution of the fractional timestamp field of each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampPrecision {
    Micro,
    Nano,
}

impl TimestampPrecision {
    /// Units of the fractional field per second.
    pub fn units_per_second(self) -> u32 {
        match self {
            TimestampPrecision::Micro => 1_000_000,
            TimestampPrecision::Nano => 1_000_000_000,
        }
    }

    /// Converts a fractional field from `self` to `to`.
    pub fn convert(self, frac: u32, to: TimestampPrecision) -> u32 {
        match (self, to) {
            (TimestampPrecision::Micro, TimestampPrecision::Nano) => frac.saturating_mul(1_000),
            (TimestampPrecision::Nano, TimestampPrecision::Micro) => frac / 1_000,
            _ => frac,
        }
    }
}

/// Magic number of a microsecond capture, as written by its producer.
pub const MAGIC_MICRO: u32 = 0xa1b2_c3d4;
/// Magic number of a nanosecond capture.
pub const MAGIC_NANO: u32 = 0xa1b2_3c4d;
/// First four bytes of a PCAPNG section header block.
pub const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// The 24-byte header at the start of a legacy capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapGlobalHeader {
    pub byte_order: ByteOrder,
    pub precision: TimestampPrecision,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub link_type: u32,
}

impl PcapGlobalHeader {
    pub const SIZE: usize = 24;

    /// Little-endian microsecond header, version 2.4, 64 KiB snap length.
    pub fn default_for(link_type: u32) -> Self {
        PcapGlobalHeader {
            byte_order: ByteOrder::Little,
            precision: TimestampPrecision::Micro,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65535,
            link_type,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let magic = match self.precision {
            TimestampPrecision::Micro => MAGIC_MICRO,
            TimestampPrecision::Nano => MAGIC_NANO,
        };
        let order = self.byte_order;
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&order.put_u32(magic));
        out[4..6].copy_from_slice(&order.put_u16(self.version_major));
        out[6..8].copy_from_slice(&order.put_u16(self.version_minor));
        out[8..12].copy_from_slice(&order.put_u32(self.thiszone as u32));
        out[12..16].copy_from_slice(&order.put_u32(self.sigfigs));
        out[16..20].copy_from_slice(&order.put_u32(self.snaplen));
        out[20..24].copy_from_slice(&order.put_u32(self.link_type));
        out
    }
}

/// The 16-byte header in front of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    pub ts_sec: u32,
    /// Microseconds or nanoseconds, per the file's precision.
    pub ts_frac: u32,
    pub captured_length: u32,
    pub original_length: u32,
}

impl RecordHeader {
    pub const SIZE: usize = 16;

    pub fn decode(bytes: &[u8; Self::SIZE], order: ByteOrder) -> Self {
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        RecordHeader {
            ts_sec: order.u32(word(0)),
            ts_frac: order.u32(word(4)),
            captured_length: order.u32(word(8)),
            original_length: order.u32(word(12)),
        }
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&order.put_u32(self.ts_sec));
        out[4..8].copy_from_slice(&order.put_u32(self.ts_frac));
        out[8..12].copy_from_slice(&order.put_u32(self.captured_length));
        out[12..16].copy_from_slice(&order.put_u32(self.original_length));
        out
    }

    /// Record header for a microsecond timestamp.
    pub fn from_micros(timestamp_us: i64, captured_length: u32, original_length: u32) -> Self {
        let timestamp_us = timestamp_us.max(0);
        RecordHeader {
            ts_sec: (timestamp_us / 1_000_000).min(i64::from(u32::MAX)) as u32,
            ts_frac: (timestamp_us % 1_000_000) as u32,
            captured_length,
            original_length,
        }
    }

    /// Timestamp in microseconds since the epoch.
    pub fn timestamp_us(&self, precision: TimestampPrecision) -> i64 {
        i64::from(self.ts_sec) * 1_000_000
            + i64::from(precision.convert(self.ts_frac, TimestampPrecision::Micro))
    }

    /// Checks the fields a well-formed record must satisfy.
    ///
    /// A fraction of exactly one second passes. A record may capture none of
    /// a packet, but the packet itself cannot be empty.
    pub fn validate(&self, precision: TimestampPrecision) -> Result<(), String> {
        if self.ts_frac > precision.units_per_second() {
            return Err(format!(
                "fractional timestamp {} out of range for {:?} precision",
                self.ts_frac, precision
            ));
        }
        if self.captured_length > self.original_length {
            return Err(format!(
                "captured length {} exceeds original length {}",
                self.captured_length, self.original_length
            ));
        }
        if self.original_length == 0 {
            return Err("empty packet".to_string());
        }
        Ok(())
    }
}
