//! Fuzz target for capture container parsing.
//!
//! Exercises magic detection, legacy and PCAPNG block parsing, record
//! header validation and the per-record skip path.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pcapflow_core::PcapReader;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut reader) = PcapReader::from_reader(data) {
        // Container errors end the loop; malformed records are skipped
        while let Ok(Some(packet)) = reader.next_packet() {
            let _ = packet.frame().protocols();
        }
    }
});
