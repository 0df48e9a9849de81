//! Fuzz target for TCP stream tracking.
//!
//! Feeds every record of an arbitrary capture through the stream handler;
//! the state machine must accept any segment sequence.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pcapflow_core::{PcapReader, StreamConfig, TcpStreamHandler};

fuzz_target!(|data: &[u8]| {
    let Ok(mut reader) = PcapReader::from_reader(data) else {
        return;
    };
    let mut handler = TcpStreamHandler::with_config(StreamConfig {
        keep_packets: false,
        max_tracked_streams: Some(64),
    });
    while let Ok(Some(packet)) = reader.next_packet() {
        handler.process(&packet);
    }
    handler.finish();
});
