//! Transparent decompression of capture files.

use std::fmt;
use std::io::{self, BufRead, Read};

#[cfg(feature = "compress-gzip")]
use flate2::bufread::GzDecoder;

/// Compression wrapped around a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    #[cfg(feature = "compress-gzip")]
    Gzip,
    #[cfg(feature = "compress-zstd")]
    Zstd,
}

impl Compression {
    /// Identify the compression from the first bytes of a file.
    ///
    /// Anything unrecognised, including formats whose feature is disabled,
    /// is `None` and left for the capture reader to reject by its magic.
    pub fn sniff(prefix: &[u8]) -> Self {
        match prefix {
            #[cfg(feature = "compress-gzip")]
            [0x1f, 0x8b, 0x08, ..] => Compression::Gzip,
            #[cfg(feature = "compress-zstd")]
            [0x28, 0xb5, 0x2f, 0xfd, ..] => Compression::Zstd,
            _ => Compression::None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != Compression::None
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            #[cfg(feature = "compress-gzip")]
            Compression::Gzip => "gzip",
            #[cfg(feature = "compress-zstd")]
            Compression::Zstd => "zstd",
        })
    }
}

/// Byte source that undoes whatever compression it finds at its start.
pub enum Decompressed<R: BufRead> {
    Plain(R),
    #[cfg(feature = "compress-gzip")]
    Gzip(GzDecoder<R>),
    #[cfg(feature = "compress-zstd")]
    Zstd(zstd::Decoder<'static, R>),
}

impl<R: BufRead> Decompressed<R> {
    /// Peek at the buffered prefix of `source` and wrap it accordingly.
    /// Nothing is consumed, so plain captures pass through untouched.
    pub fn sniff(mut source: R) -> io::Result<Self> {
        let compression = Compression::sniff(source.fill_buf()?);
        Self::with_compression(source, compression)
    }

    pub fn with_compression(source: R, compression: Compression) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Decompressed::Plain(source),
            #[cfg(feature = "compress-gzip")]
            Compression::Gzip => Decompressed::Gzip(GzDecoder::new(source)),
            #[cfg(feature = "compress-zstd")]
            Compression::Zstd => Decompressed::Zstd(zstd::Decoder::with_buffer(source)?),
        })
    }

    pub fn compression(&self) -> Compression {
        match self {
            Decompressed::Plain(_) => Compression::None,
            #[cfg(feature = "compress-gzip")]
            Decompressed::Gzip(_) => Compression::Gzip,
            #[cfg(feature = "compress-zstd")]
            Decompressed::Zstd(_) => Compression::Zstd,
        }
    }
}

impl<R: BufRead> Read for Decompressed<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompressed::Plain(r) => r.read(buf),
            #[cfg(feature = "compress-gzip")]
            Decompressed::Gzip(r) => r.read(buf),
            #[cfg(feature = "compress-zstd")]
            Decompressed::Zstd(r) => r.read(buf),
        }
    }
}
