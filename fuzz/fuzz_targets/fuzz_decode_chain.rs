//! Fuzz target for the decoder chain.
//!
//! Frames and parses every layer of arbitrary bytes under each supported
//! top-level protocol, re-serializing every layer that parses.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pcapflow_core::{default_registry, Buffer, Frame, Protocol};

fuzz_target!(|data: &[u8]| {
    let registry = default_registry();

    for top in [Protocol::Ethernet, Protocol::Sll, Protocol::Ipv4, Protocol::Ipv6] {
        let Ok(Some(root)) = Frame::decode(&registry, top, Buffer::from(data)) else {
            continue;
        };
        let mut frame = Some(root);
        while let Some(current) = frame {
            if let Ok(packet) = current.parse() {
                let _ = packet.encapsulated(None);
            }
            frame = current.next_frame().ok().flatten();
        }
    }
});
