//! Byte sources for the capture reader.

mod decompress;

pub use decompress::{Compression, Decompressed};
