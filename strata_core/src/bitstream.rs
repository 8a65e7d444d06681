use std::fmt;
use thiserror::Error;

/// Errors raised by bit-level reads, seeks and streaming pulls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitStreamError {
    #[error("Cannot read {wanted} bits at position {position}, stream only has {length} bits")]
    OutOfRange {
        position: u64,
        wanted: u64,
        length: u64,
    },
    #[error("Cannot seek to bit {position}, stream only has {length} bits")]
    SeekOutOfRange { position: u64, length: u64 },
    #[error("Cannot read {0} bits into a 64-bit integer")]
    TooWide(u64),
    #[error("Byte source failed: {0}")]
    Source(String),
}

/// A live producer of input bytes, used when the payload is not buffered up front.
///
/// `pull` is asked for at least `want` more bytes and may return fewer. An empty
/// vector signals the source is exhausted.
pub trait ByteSource: Send {
    fn pull(&mut self, want: usize) -> std::io::Result<Vec<u8>>;
}

/// A bit-addressable, seekable buffer.
///
/// Bits are stored MSB first. `origin` is the absolute bit offset of this stream's
/// first bit inside the outermost stream it was sliced from, which lets the cracker
/// report positions that are meaningful to the caller regardless of nesting.
pub struct BitStream {
    buf: Vec<u8>,
    len_bits: u64,
    pos: u64,
    origin: u64,
    source: Option<Box<dyn ByteSource>>,
}

impl BitStream {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            len_bits: 0,
            pos: 0,
            origin: 0,
            source: None,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let buf = bytes.into();
        let len_bits = buf.len() as u64 * 8;
        Self {
            buf,
            len_bits,
            ..Self::new()
        }
    }

    /// Builds a stream holding the first `len_bits` bits of `bytes`.
    pub fn from_bits(mut bytes: Vec<u8>, len_bits: u64) -> Self {
        let len_bits = len_bits.min(bytes.len() as u64 * 8);
        bytes.truncate(len_bits.div_ceil(8) as usize);
        let tail = (len_bits % 8) as u32;
        if tail != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xffu8 << (8 - tail);
            }
        }
        Self {
            buf: bytes,
            len_bits,
            ..Self::new()
        }
    }

    /// Wraps a streaming source. `initial` holds whatever has already arrived.
    pub fn with_source(initial: Vec<u8>, source: Box<dyn ByteSource>) -> Self {
        let mut stream = Self::from_bytes(initial);
        stream.source = Some(source);
        stream
    }

    pub fn len_bits(&self) -> u64 {
        self.len_bits
    }

    pub fn len_bytes(&self) -> u64 {
        self.len_bits.div_ceil(8)
    }

    pub fn is_empty(&self) -> bool {
        self.len_bits == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.len_bits - self.pos
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn absolute_position(&self) -> u64 {
        self.origin + self.pos
    }

    /// Rebases a rebuilt stream onto the input region it was read from.
    pub(crate) fn set_origin(&mut self, origin: u64) {
        self.origin = origin;
    }

    pub fn seek(&mut self, position: u64) -> Result<(), BitStreamError> {
        if position > self.len_bits {
            return Err(BitStreamError::SeekOutOfRange {
                position,
                length: self.len_bits,
            });
        }
        self.pos = position;
        Ok(())
    }

    /// Requests that at least `count` unread bytes be available, pulling from the
    /// attached source if there is one. Streams without a source are left as is.
    pub fn want_bytes(&mut self, count: u64) -> Result<(), BitStreamError> {
        loop {
            let available = self.remaining() / 8;
            if available >= count {
                return Ok(());
            }
            let Some(source) = self.source.as_mut() else {
                return Ok(());
            };
            let more = source
                .pull((count - available) as usize)
                .map_err(|e| BitStreamError::Source(e.to_string()))?;
            if more.is_empty() {
                return Ok(());
            }
            self.write_bytes(&more);
        }
    }

    fn bit(&self, index: u64) -> bool {
        let byte = self.buf[(index / 8) as usize];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    fn push_bit(&mut self, bit: bool) {
        let offset = (self.len_bits % 8) as u32;
        if offset == 0 {
            self.buf.push(0);
        }
        if bit {
            if let Some(last) = self.buf.last_mut() {
                *last |= 0x80 >> offset;
            }
        }
        self.len_bits += 1;
    }

    fn check_read(&self, wanted: u64) -> Result<(), BitStreamError> {
        if wanted > self.remaining() {
            return Err(BitStreamError::OutOfRange {
                position: self.pos,
                wanted,
                length: self.len_bits,
            });
        }
        Ok(())
    }

    /// Reads `count` bits as a big-endian unsigned integer.
    pub fn read_bits(&mut self, count: u64) -> Result<u64, BitStreamError> {
        if count > 64 {
            return Err(BitStreamError::TooWide(count));
        }
        self.check_read(count)?;
        let mut value = 0u64;
        for i in 0..count {
            value = (value << 1) | u64::from(self.bit(self.pos + i));
        }
        self.pos += count;
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>, BitStreamError> {
        self.check_read(count * 8)?;
        if self.pos % 8 == 0 {
            let start = (self.pos / 8) as usize;
            let bytes = self.buf[start..start + count as usize].to_vec();
            self.pos += count * 8;
            return Ok(bytes);
        }
        let mut bytes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            bytes.push(self.read_bits(8)? as u8);
        }
        Ok(bytes)
    }

    /// Cuts the next `count` bits out as an independent stream and advances past them.
    pub fn slice_bits(&mut self, count: u64) -> Result<BitStream, BitStreamError> {
        let mut slice = self.peek_bits(self.pos, count)?;
        slice.origin = self.origin + self.pos;
        self.pos += count;
        Ok(slice)
    }

    /// Copies `count` bits starting at `at` without moving the read position.
    pub fn peek_bits(&self, at: u64, count: u64) -> Result<BitStream, BitStreamError> {
        if at.saturating_add(count) > self.len_bits {
            return Err(BitStreamError::OutOfRange {
                position: at,
                wanted: count,
                length: self.len_bits,
            });
        }
        if at % 8 == 0 {
            let start = (at / 8) as usize;
            let end = (at + count).div_ceil(8) as usize;
            return Ok(BitStream::from_bits(self.buf[start..end].to_vec(), count));
        }
        let mut out = BitStream::new();
        for i in 0..count {
            out.push_bit(self.bit(at + i));
        }
        Ok(out)
    }

    /// True when `token` occurs at bit offset `at`.
    pub fn matches_at(&self, at: u64, token: &BitStream) -> bool {
        if at.saturating_add(token.len_bits) > self.len_bits {
            return false;
        }
        if at % 8 == 0 && token.len_bits % 8 == 0 {
            let start = (at / 8) as usize;
            return self.buf[start..start + token.buf.len()] == token.buf[..];
        }
        (0..token.len_bits).all(|i| self.bit(at + i) == token.bit(i))
    }

    /// Bit offset of the first occurrence of `token` at or after `start`.
    pub fn find(&self, token: &BitStream, start: u64) -> Option<u64> {
        if token.is_empty() || token.len_bits > self.len_bits {
            return None;
        }
        let last = self.len_bits - token.len_bits;
        (start..=last).find(|&at| self.matches_at(at, token))
    }

    /// Appends the low `count` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        for shift in (0..count).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.len_bits % 8 == 0 {
            self.buf.extend_from_slice(bytes);
            self.len_bits += bytes.len() as u64 * 8;
        } else {
            for byte in bytes {
                self.write_bits(u64::from(*byte), 8);
            }
        }
    }

    pub fn append(&mut self, other: &BitStream) {
        if self.len_bits % 8 == 0 {
            self.buf.extend_from_slice(&other.buf);
            self.len_bits += other.len_bits;
        } else {
            for i in 0..other.len_bits {
                self.push_bit(other.bit(i));
            }
        }
    }

    /// The packed bytes. A trailing partial byte is zero padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.buf)
    }
}

impl Default for BitStream {
    fn default() -> Self {
        Self::new()
    }
}

// Clones are detached snapshots; a live source stays with the original stream.
impl Clone for BitStream {
    fn clone(&self) -> Self {
        Self {
            buf: self.buf.clone(),
            len_bits: self.len_bits,
            pos: self.pos,
            origin: self.origin,
            source: None,
        }
    }
}

impl PartialEq for BitStream {
    fn eq(&self, other: &Self) -> bool {
        self.len_bits == other.len_bits && self.buf == other.buf
    }
}

impl fmt::Debug for BitStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitStream")
            .field("hex", &self.to_hex())
            .field("len_bits", &self.len_bits)
            .field("pos", &self.pos)
            .field("origin", &self.origin)
            .field("streaming", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for BitStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len_bits % 8 == 0 {
            write!(f, "{}", self.to_hex())
        } else {
            write!(f, "{} ({} bits)", self.to_hex(), self.len_bits)
        }
    }
}

impl From<Vec<u8>> for BitStream {
    fn from(bytes: Vec<u8>) -> Self {
        BitStream::from_bytes(bytes)
    }
}

impl From<&[u8]> for BitStream {
    fn from(bytes: &[u8]) -> Self {
        BitStream::from_bytes(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChunkedSource {
        chunks: Vec<Vec<u8>>,
    }

    impl ByteSource for ChunkedSource {
        fn pull(&mut self, _want: usize) -> std::io::Result<Vec<u8>> {
            if self.chunks.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.chunks.remove(0))
            }
        }
    }

    #[test]
    fn write_and_read_unaligned_bits() {
        let mut stream = BitStream::new();
        stream.write_bits(0b101, 3);
        stream.write_bits(0xabcd, 16);
        stream.write_bits(1, 1);
        assert_eq!(stream.len_bits(), 20);
        assert_eq!(stream.len_bytes(), 3);

        assert_eq!(stream.read_bits(3).unwrap(), 0b101);
        assert_eq!(stream.read_bits(16).unwrap(), 0xabcd);
        assert_eq!(stream.read_bits(1).unwrap(), 1);
        assert!(stream.read_bits(1).is_err(), "Reading past the end must fail");
    }

    #[test]
    fn slice_tracks_absolute_origin() {
        let mut outer = BitStream::from_bytes(vec![1, 2, 3, 4, 5]);
        outer.seek(8).unwrap();
        let mut inner = outer.slice_bits(24).unwrap();
        assert_eq!(outer.position(), 32, "Slicing should advance the parent");
        assert_eq!(inner.origin(), 8);
        inner.seek(8).unwrap();
        let nested = inner.slice_bits(8).unwrap();
        assert_eq!(nested.origin(), 16, "Nested slices accumulate offsets");
        assert_eq!(nested.as_bytes(), &[3]);
    }

    #[test]
    fn find_locates_aligned_and_unaligned_tokens() {
        let data = BitStream::from_bytes(b"xxAByyAB".to_vec());
        let token = BitStream::from_bytes(b"AB".to_vec());
        assert_eq!(data.find(&token, 0), Some(16));
        assert_eq!(data.find(&token, 17), Some(48));

        let mut shifted = BitStream::new();
        shifted.write_bits(0, 3);
        shifted.write_bytes(b"AB");
        assert_eq!(shifted.find(&token, 0), Some(3));
    }

    #[test]
    fn want_bytes_pulls_from_source_until_satisfied() {
        let source = ChunkedSource {
            chunks: vec![vec![2], vec![3, 4]],
        };
        let mut stream = BitStream::with_source(vec![1], Box::new(source));
        stream.want_bytes(3).unwrap();
        assert_eq!(stream.as_bytes(), &[1, 2, 3, 4]);
        stream.want_bytes(10).unwrap();
        assert_eq!(stream.len_bytes(), 4, "Exhausted source leaves the stream as is");
    }

    #[test]
    fn equality_ignores_position() {
        let mut a = BitStream::from_bytes(vec![0xff, 0x00]);
        let b = BitStream::from_bytes(vec![0xff, 0x00]);
        a.seek(4).unwrap();
        assert_eq!(a, b);
        assert_ne!(BitStream::from_bits(vec![0xff], 7), BitStream::from_bytes(vec![0xff]));
    }
}
