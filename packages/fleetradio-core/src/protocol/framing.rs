//! Length-prefixed binary framing shared by the local remote-control,
//! internal peer, and collaboration-bus protocols (§6.1–§6.3).
//!
//! Every message is a big-endian `u16` length followed by that many bytes of
//! a hand-rolled binary payload: a `u8` discriminant per tagged-enum
//! variant, followed by that variant's fields in declaration order. Strings
//! (including the JSON text carried in the `goals`/`environment` fields of
//! the control protocol) are a `u32` length prefix plus UTF-8 bytes; lists
//! are a `u32` count prefix plus that many encoded elements.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::ProtocolError;

/// Maximum accepted frame payload size: the largest value a `u16` length
/// prefix can express.
pub const MAX_FRAME_LEN: u16 = u16::MAX;

/// Appends primitive fields to a message's binary payload.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Writes one discriminant/data byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a big-endian `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    /// Writes a big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Writes a big-endian `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Writes a big-endian IEEE-754 `f64`.
    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    /// Writes a `bool` as one byte.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Writes raw bytes with no length prefix.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }
}

/// Reads primitive fields back off a message's binary payload, tracking
/// position and returning [`ProtocolError::Truncated`] on underrun.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.bytes.len() - self.pos < len {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian `u16`.
    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    /// Reads a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    /// Reads a big-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a big-endian IEEE-754 `f64`.
    pub fn get_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a one-byte `bool`.
    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads `len` raw bytes with no length prefix.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }
}

/// A type with a fixed binary wire representation, composed of the
/// primitives on [`Writer`]/[`Reader`].
pub trait BinaryCodec: Sized {
    /// Appends this value's fields to `w`.
    fn write_to(&self, w: &mut Writer);

    /// Reads a value back from `r`.
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError>;
}

impl BinaryCodec for u8 {
    fn write_to(&self, w: &mut Writer) {
        w.put_u8(*self);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        r.get_u8()
    }
}

impl BinaryCodec for u16 {
    fn write_to(&self, w: &mut Writer) {
        w.put_u16(*self);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        r.get_u16()
    }
}

impl BinaryCodec for u32 {
    fn write_to(&self, w: &mut Writer) {
        w.put_u32(*self);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        r.get_u32()
    }
}

impl BinaryCodec for u64 {
    fn write_to(&self, w: &mut Writer) {
        w.put_u64(*self);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        r.get_u64()
    }
}

impl BinaryCodec for f64 {
    fn write_to(&self, w: &mut Writer) {
        w.put_f64(*self);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        r.get_f64()
    }
}

impl BinaryCodec for bool {
    fn write_to(&self, w: &mut Writer) {
        w.put_bool(*self);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        r.get_bool()
    }
}

impl BinaryCodec for String {
    fn write_to(&self, w: &mut Writer) {
        w.put_u32(self.len() as u32);
        w.put_slice(self.as_bytes());
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        let len = r.get_u32()? as usize;
        let bytes = r.get_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl<T: BinaryCodec> BinaryCodec for Option<T> {
    fn write_to(&self, w: &mut Writer) {
        match self {
            Some(v) => {
                w.put_bool(true);
                v.write_to(w);
            }
            None => w.put_bool(false),
        }
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        if r.get_bool()? {
            Ok(Some(T::read_from(r)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: BinaryCodec> BinaryCodec for Vec<T> {
    fn write_to(&self, w: &mut Writer) {
        w.put_u32(self.len() as u32);
        for item in self {
            item.write_to(w);
        }
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        let count = r.get_u32()? as usize;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(T::read_from(r)?);
        }
        Ok(items)
    }
}

impl<A: BinaryCodec, B: BinaryCodec> BinaryCodec for (A, B) {
    fn write_to(&self, w: &mut Writer) {
        self.0.write_to(w);
        self.1.write_to(w);
    }
    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok((A::read_from(r)?, B::read_from(r)?))
    }
}

/// Encodes `message` as a length-prefixed binary frame.
pub fn encode<T: BinaryCodec>(message: &T) -> Result<BytesMut, ProtocolError> {
    let mut w = Writer::new();
    message.write_to(&mut w);
    let payload = w.buf;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Decodes a length-prefixed binary frame from a byte slice already known
/// to contain a full frame (length prefix plus payload).
pub fn decode<T: BinaryCodec>(mut bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let len = bytes.get_u16() as usize;
    if bytes.len() < len {
        return Err(ProtocolError::Truncated);
    }
    let mut r = Reader::new(&bytes[..len]);
    T::read_from(&mut r)
}

/// Reads one length-prefixed frame from an async stream and decodes it.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: BinaryCodec,
    R: tokio::io::AsyncRead + Unpin,
{
    let len = reader.read_u16().await?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let mut r = Reader::new(&payload);
    T::read_from(&mut r)
}

/// Encodes and writes `message` as one length-prefixed frame to an async
/// stream.
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: BinaryCodec,
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    impl BinaryCodec for Sample {
        fn write_to(&self, w: &mut Writer) {
            self.a.write_to(w);
            self.b.write_to(w);
        }
        fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
            Ok(Self {
                a: u32::read_from(r)?,
                b: String::read_from(r)?,
            })
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let msg = Sample {
            a: 42,
            b: "hello".to_string(),
        };
        let frame = encode(&msg).unwrap();
        let decoded: Sample = decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let result: Result<Sample, _> = decode(&[0, 5]);
        assert!(matches!(result, Err(ProtocolError::Truncated)));
    }

    #[test]
    fn length_prefix_is_two_bytes_not_four() {
        let msg = Sample {
            a: 1,
            b: String::new(),
        };
        let frame = encode(&msg).unwrap();
        // 4-byte u32 payload + 4-byte empty-string length prefix = 8 bytes
        // of payload, plus the 2-byte frame length prefix itself.
        assert_eq!(frame.len(), 10);
    }

    #[tokio::test]
    async fn read_write_frame_round_trips_over_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Sample {
            a: 7,
            b: "peer".to_string(),
        };
        write_frame(&mut client, &msg).await.unwrap();
        let decoded: Sample = read_frame(&mut server).await.unwrap();
        assert_eq!(msg, decoded);
    }
}
