//! Bounds-checked byte views with a read cursor.
//!
//! A [`Buffer`] is a window `[origin, origin + capacity)` over reference-counted
//! storage. Slicing never copies: every slice of a buffer shares the parent's
//! storage, so a write through one view is visible through all of them.
//! [`Clone`] is the opposite, a deep copy into fresh storage.
//!
//! All positions taken and returned by a buffer are relative to its own origin.
//!
//! ```
//! use pcapflow_core::Buffer;
//!
//! let mut buffer = Buffer::from(b"INVITE sip:bob\r\nVia: x\r\n".to_vec());
//! let line = buffer.read_line().unwrap();
//! assert_eq!(line.to_vec(), b"INVITE sip:bob");
//! assert_eq!(buffer.read_line().unwrap().to_vec(), b"Via: x");
//! assert!(buffer.read_line().is_none());
//! ```

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;

use crate::error::BufferError;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

pub(crate) type Storage = Arc<RwLock<Vec<u8>>>;

/// A cursor-carrying view over shared byte storage.
pub struct Buffer {
    storage: Storage,
    origin: usize,
    capacity: usize,
    reader_index: usize,
    marked_index: usize,
}

impl Buffer {
    /// Wraps `data` in a buffer that owns it exclusively.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let capacity = data.len();
        Buffer {
            storage: Arc::new(RwLock::new(data)),
            origin: 0,
            capacity,
            reader_index: 0,
            marked_index: 0,
        }
    }

    /// An empty buffer.
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// A buffer of `capacity` zero bytes.
    pub fn zeroed(capacity: usize) -> Self {
        Self::from_vec(vec![0; capacity])
    }

    /// Concatenates the visible bytes of `parts` into one new buffer.
    pub fn concat(parts: &[&Buffer]) -> Self {
        let total = parts.iter().map(|p| p.capacity).sum();
        let mut data = Vec::with_capacity(total);
        for part in parts {
            part.with_bytes(|b| data.extend_from_slice(b));
        }
        Self::from_vec(data)
    }

    fn read_storage(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_storage(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, index: usize, length: usize) -> Result<(), BufferError> {
        match index.checked_add(length) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(BufferError::OutOfBounds {
                index,
                length,
                capacity: self.capacity,
            }),
        }
    }

    /// Runs `f` over the visible bytes without copying them.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.read_storage();
        f(&storage[self.origin..self.origin + self.capacity])
    }

    /// Runs `f` over the unread bytes without copying them.
    pub fn with_readable_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.read_storage();
        f(&storage[self.origin + self.reader_index..self.origin + self.capacity])
    }

    // ---------------------------------------------------------------------
    // Cursor
    // ---------------------------------------------------------------------

    /// Number of visible bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn set_reader_index(&mut self, index: usize) -> Result<(), BufferError> {
        self.check(index, 0)?;
        self.reader_index = index;
        Ok(())
    }

    /// Bytes between the cursor and the end of the view.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.capacity - self.reader_index
    }

    #[inline]
    pub fn has_readable_bytes(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Position of the cursor within the capture record this view was cut from.
    pub fn record_offset(&self) -> usize {
        self.origin + self.reader_index
    }

    pub fn mark_reader_index(&mut self) {
        self.marked_index = self.reader_index;
    }

    pub fn reset_reader_index(&mut self) {
        self.reader_index = self.marked_index;
    }

    /// Advances the cursor by `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        self.check(self.reader_index, n)?;
        self.reader_index += n;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Relative reads
    // ---------------------------------------------------------------------

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        let value = self.get_u8(self.reader_index)?;
        self.reader_index += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        let value = self.get_u16(self.reader_index)?;
        self.reader_index += 2;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> Result<i16, BufferError> {
        self.read_u16().map(|v| v as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        let value = self.get_u32(self.reader_index)?;
        self.reader_index += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        self.read_u32().map(|v| v as i32)
    }

    /// Slices the next `n` bytes off the cursor and advances past them.
    pub fn read_bytes(&mut self, n: usize) -> Result<Buffer, BufferError> {
        let end = self
            .reader_index
            .checked_add(n)
            .ok_or(BufferError::OutOfBounds {
                index: self.reader_index,
                length: n,
                capacity: self.capacity,
            })?;
        let slice = self.slice(self.reader_index, end)?;
        self.reader_index = end;
        Ok(slice)
    }

    /// Reads one line terminated by CR, LF or CRLF.
    ///
    /// The terminator is consumed but not returned. Bytes left after the last
    /// terminator form a final line. Returns `None` only when nothing is left
    /// to read; an empty line between two terminators is `Some` of an empty
    /// buffer.
    pub fn read_line(&mut self) -> Option<Buffer> {
        if !self.has_readable_bytes() {
            return None;
        }

        let start = self.reader_index;
        let (line_end, next) = self.with_readable_bytes(|bytes| {
            match bytes.iter().position(|&b| b == CR || b == LF) {
                Some(pos) if bytes[pos] == CR && bytes.get(pos + 1) == Some(&LF) => {
                    (start + pos, start + pos + 2)
                }
                Some(pos) => (start + pos, start + pos + 1),
                None => (start + bytes.len(), start + bytes.len()),
            }
        });

        self.reader_index = next;
        Some(self.view(start, line_end))
    }

    /// Index of the first `byte` at or after the cursor.
    pub fn index_of(&self, byte: u8) -> Option<usize> {
        self.with_readable_bytes(|bytes| bytes.iter().position(|&b| b == byte))
            .map(|pos| self.reader_index + pos)
    }

    /// The byte at the cursor, without advancing.
    pub fn peek_u8(&self) -> Result<u8, BufferError> {
        self.get_u8(self.reader_index)
    }

    /// Reads up to the first byte found in `delimiters`, scanning at most
    /// `max_bytes` bytes from the cursor.
    ///
    /// The delimiter is consumed but not returned. `Ok(None)` means the
    /// readable bytes ran out first; [`BufferError::DelimiterLimit`] means
    /// more bytes remained past the scan window. In both cases the cursor
    /// does not move.
    pub fn read_until(
        &mut self,
        max_bytes: usize,
        delimiters: &[u8],
    ) -> Result<Option<Buffer>, BufferError> {
        let found = self.with_readable_bytes(|bytes| {
            let window = &bytes[..bytes.len().min(max_bytes)];
            match window.iter().position(|b| delimiters.contains(b)) {
                Some(pos) => Ok(Some(pos)),
                None if bytes.len() > max_bytes => Err(BufferError::DelimiterLimit { max_bytes }),
                None => Ok(None),
            }
        })?;

        Ok(found.map(|pos| {
            let start = self.reader_index;
            self.reader_index = start + pos + 1;
            self.view(start, start + pos)
        }))
    }

    /// Reads up to the first CRLF, consuming it. `None` leaves the cursor
    /// where it was.
    pub fn read_until_single_crlf(&mut self) -> Option<Buffer> {
        self.read_until_sequence(b"\r\n")
    }

    /// Reads up to the first CRLFCRLF, e.g. the end of a SIP or HTTP header
    /// block, consuming it. `None` leaves the cursor where it was.
    pub fn read_until_double_crlf(&mut self) -> Option<Buffer> {
        self.read_until_sequence(b"\r\n\r\n")
    }

    fn read_until_sequence(&mut self, terminator: &[u8]) -> Option<Buffer> {
        let pos = self.with_readable_bytes(|bytes| {
            bytes
                .windows(terminator.len())
                .position(|window| window == terminator)
        })?;
        let start = self.reader_index;
        self.reader_index = start + pos + terminator.len();
        Some(self.view(start, start + pos))
    }

    /// Parses the unread bytes as a signed decimal integer.
    pub fn parse_to_int(&self) -> Result<i32, BufferError> {
        self.parse_to_int_radix(10)
    }

    /// Parses the unread bytes as a signed integer in `radix` (2 to 36).
    ///
    /// Only an optional leading `-` and digits are accepted; the cursor does
    /// not move.
    pub fn parse_to_int_radix(&self, radix: u32) -> Result<i32, BufferError> {
        self.with_readable_bytes(|bytes| {
            let not_a_number = || BufferError::NotANumber {
                text: String::from_utf8_lossy(bytes).into_owned(),
                radix,
            };
            if !(2..=36).contains(&radix) || bytes.first() == Some(&b'+') {
                return Err(not_a_number());
            }
            std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| i32::from_str_radix(text, radix).ok())
                .ok_or_else(not_a_number)
        })
    }

    /// Content equality ignoring ASCII case, e.g. for header names.
    pub fn equals_ignore_case(&self, other: &[u8]) -> bool {
        self.with_bytes(|bytes| bytes.eq_ignore_ascii_case(other))
    }

    // ---------------------------------------------------------------------
    // Absolute reads
    // ---------------------------------------------------------------------

    pub fn get_u8(&self, index: usize) -> Result<u8, BufferError> {
        self.check(index, 1)?;
        Ok(self.read_storage()[self.origin + index])
    }

    fn get_array<const N: usize>(&self, index: usize) -> Result<[u8; N], BufferError> {
        self.check(index, N)?;
        let start = self.origin + index;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.read_storage()[start..start + N]);
        Ok(out)
    }

    /// Big-endian (network order) u16 at `index`.
    pub fn get_u16(&self, index: usize) -> Result<u16, BufferError> {
        self.get_array(index).map(u16::from_be_bytes)
    }

    pub fn get_i16(&self, index: usize) -> Result<i16, BufferError> {
        self.get_array(index).map(i16::from_be_bytes)
    }

    /// Big-endian (network order) u32 at `index`.
    pub fn get_u32(&self, index: usize) -> Result<u32, BufferError> {
        self.get_array(index).map(u32::from_be_bytes)
    }

    pub fn get_i32(&self, index: usize) -> Result<i32, BufferError> {
        self.get_array(index).map(i32::from_be_bytes)
    }

    pub fn get_u16_le(&self, index: usize) -> Result<u16, BufferError> {
        self.get_array(index).map(u16::from_le_bytes)
    }

    pub fn get_u32_le(&self, index: usize) -> Result<u32, BufferError> {
        self.get_array(index).map(u32::from_le_bytes)
    }

    // ---------------------------------------------------------------------
    // Writes (visible through every view of the same storage)
    // ---------------------------------------------------------------------

    pub fn set_u8(&self, index: usize, value: u8) -> Result<(), BufferError> {
        self.set_bytes(index, &[value])
    }

    pub fn set_u16(&self, index: usize, value: u16) -> Result<(), BufferError> {
        self.set_bytes(index, &value.to_be_bytes())
    }

    pub fn set_u32(&self, index: usize, value: u32) -> Result<(), BufferError> {
        self.set_bytes(index, &value.to_be_bytes())
    }

    pub fn set_bytes(&self, index: usize, bytes: &[u8]) -> Result<(), BufferError> {
        self.check(index, bytes.len())?;
        let start = self.origin + index;
        self.write_storage()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Slicing
    // ---------------------------------------------------------------------

    fn view(&self, start: usize, end: usize) -> Buffer {
        Buffer {
            storage: Arc::clone(&self.storage),
            origin: self.origin + start,
            capacity: end - start,
            reader_index: 0,
            marked_index: 0,
        }
    }

    /// View over `[start, end)` of this buffer, sharing storage.
    pub fn slice(&self, start: usize, end: usize) -> Result<Buffer, BufferError> {
        if start > end {
            return Err(BufferError::OutOfBounds {
                index: start,
                length: 0,
                capacity: self.capacity,
            });
        }
        self.check(start, end - start)?;
        Ok(self.view(start, end))
    }

    /// View from the cursor up to the absolute position `end`.
    pub fn slice_to(&self, end: usize) -> Result<Buffer, BufferError> {
        self.slice(self.reader_index, end)
    }

    /// View over every unread byte.
    pub fn slice_readable(&self) -> Buffer {
        self.view(self.reader_index, self.capacity)
    }

    /// A second handle on the same bytes with the same cursor.
    ///
    /// Unlike [`Clone`], nothing is copied.
    pub fn share(&self) -> Buffer {
        Buffer {
            storage: Arc::clone(&self.storage),
            origin: self.origin,
            capacity: self.capacity,
            reader_index: self.reader_index,
            marked_index: self.marked_index,
        }
    }

    // ---------------------------------------------------------------------
    // Storage identity, used to deep-copy whole records
    // ---------------------------------------------------------------------

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Copies the complete backing storage, including bytes outside this view.
    pub(crate) fn copy_storage(&self) -> Storage {
        Arc::new(RwLock::new(self.read_storage().clone()))
    }

    /// Re-targets this view from `old` storage onto `new`, keeping origin and
    /// cursor. Views over unrelated storage are deep-copied instead.
    pub(crate) fn rebind(&self, old: &Storage, new: &Storage) -> Buffer {
        if Arc::ptr_eq(&self.storage, old) {
            Buffer {
                storage: Arc::clone(new),
                ..self.share()
            }
        } else {
            self.clone()
        }
    }

    // ---------------------------------------------------------------------
    // Conversion
    // ---------------------------------------------------------------------

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_vec())
    }

    /// Writes every visible byte to `out`.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        self.with_bytes(|bytes| out.write_all(bytes))
    }
}

impl Clone for Buffer {
    /// Copies the visible bytes into new storage, keeping the cursor.
    fn clone(&self) -> Self {
        Buffer {
            storage: Arc::new(RwLock::new(self.to_vec())),
            origin: 0,
            capacity: self.capacity,
            reader_index: self.reader_index,
            marked_index: self.marked_index,
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        if self.capacity != other.capacity {
            return false;
        }
        if Arc::ptr_eq(&self.storage, &other.storage) {
            let storage = self.read_storage();
            return storage[self.origin..self.origin + self.capacity]
                == storage[other.origin..other.origin + other.capacity];
        }
        self.with_bytes(|a| other.with_bytes(|b| a == b))
    }
}

impl Eq for Buffer {}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.with_bytes(|a| a == other)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 32;
        let preview = self.with_bytes(|bytes| {
            let shown = &bytes[..bytes.len().min(PREVIEW)];
            let mut hex = String::with_capacity(shown.len() * 2 + 3);
            for b in shown {
                hex.push_str(&format!("{b:02x}"));
            }
            if bytes.len() > PREVIEW {
                hex.push_str("...");
            }
            hex
        });
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity)
            .field("reader_index", &self.reader_index)
            .field("bytes", &preview)
            .finish()
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_bytes(|bytes| f.write_str(&String::from_utf8_lossy(bytes)))
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::empty()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from_vec(data)
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Buffer::from_vec(data.to_vec())
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Buffer::from_vec(data.to_vec())
    }
}
