//! Length-prefixed framed transport.
//!
//! Frames are a u32 big-endian length followed by the payload. The first
//! exchange on a connection is always plain JSON: the client states the
//! encoding and compression it wants, the server acknowledges, and both
//! sides switch. Bulk byte streams ride as raw chunk frames closed by a
//! zero-length frame and an encoded [`BulkTrailer`].

use std::io::{Read, Write};
use std::time::Duration;

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wire::{BulkTrailer, Msg};

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Chunk size used when streaming bulk payloads.
pub const DATA_CHUNK: usize = 256 * 1024;

/// Default idle read timeout on the transport.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Negotiated message encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    MsgPack,
    Bson,
}

impl Encoding {
    pub fn token(self) -> &'static str {
        match self {
            Encoding::Json => "JSON",
            Encoding::MsgPack => "MSGP",
            Encoding::Bson => "BSON",
        }
    }

    pub fn from_token(s: &str) -> Result<Self> {
        match s {
            "JSON" => Ok(Encoding::Json),
            "MSGP" => Ok(Encoding::MsgPack),
            "BSON" => Ok(Encoding::Bson),
            other => Err(Error::Protocol(format!("unknown encoding: {other}"))),
        }
    }
}

/// Negotiated transport compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCompression {
    None,
    Zlib,
    /// zlib with compressor state persisting across frames (sync flush).
    ZlibStream,
    Snappy,
}

impl TransportCompression {
    pub fn token(self) -> &'static str {
        match self {
            TransportCompression::None => "none",
            TransportCompression::Zlib => "zlib",
            TransportCompression::ZlibStream => "zlibstream",
            TransportCompression::Snappy => "snappy",
        }
    }

    pub fn from_token(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(TransportCompression::None),
            "zlib" => Ok(TransportCompression::Zlib),
            "zlibstream" | "zlib-stream" => Ok(TransportCompression::ZlibStream),
            "snappy" => Ok(TransportCompression::Snappy),
            other => Err(Error::Protocol(format!("unknown compression: {other}"))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    encoding: String,
    compress: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloAck {
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// A framed, encoded, optionally compressed message transport over any
/// blocking byte stream.
pub struct Transport<S: Read + Write> {
    stream: S,
    encoding: Encoding,
    compression: TransportCompression,
    deflate: Option<Compress>,
    inflate: Option<Decompress>,
    next_msgid: u64,
}

impl<S: Read + Write> Transport<S> {
    /// Client side: propose encoding and compression, wait for the ack.
    pub fn client(
        mut stream: S,
        encoding: Encoding,
        compression: TransportCompression,
    ) -> Result<Self> {
        let hello = Hello {
            encoding: encoding.token().to_string(),
            compress: compression.token().to_string(),
        };
        let raw = serde_json::to_vec(&hello).map_err(|e| Error::Encode(e.to_string()))?;
        write_frame(&mut stream, &raw)?;
        let ack_raw = read_frame(&mut stream)?;
        let ack: HelloAck =
            serde_json::from_slice(&ack_raw).map_err(|e| Error::Protocol(e.to_string()))?;
        if ack.status != "OK" {
            return Err(Error::Protocol(
                ack.error.unwrap_or_else(|| "handshake rejected".into()),
            ));
        }
        Ok(Self::negotiated(stream, encoding, compression))
    }

    /// Server side: read the client's proposal and acknowledge it.
    pub fn server(mut stream: S) -> Result<Self> {
        let raw = read_frame(&mut stream)?;
        let hello: Hello =
            serde_json::from_slice(&raw).map_err(|e| Error::Protocol(e.to_string()))?;
        let negotiated = Encoding::from_token(&hello.encoding)
            .and_then(|e| TransportCompression::from_token(&hello.compress).map(|c| (e, c)));
        match negotiated {
            Ok((encoding, compression)) => {
                let ack = HelloAck { status: "OK".into(), error: None };
                let ack_raw =
                    serde_json::to_vec(&ack).map_err(|e| Error::Encode(e.to_string()))?;
                write_frame(&mut stream, &ack_raw)?;
                Ok(Self::negotiated(stream, encoding, compression))
            }
            Err(e) => {
                let ack = HelloAck { status: "FAIL".into(), error: Some(e.to_string()) };
                if let Ok(ack_raw) = serde_json::to_vec(&ack) {
                    let _ = write_frame(&mut stream, &ack_raw);
                }
                Err(e)
            }
        }
    }

    fn negotiated(stream: S, encoding: Encoding, compression: TransportCompression) -> Self {
        let streaming = compression == TransportCompression::ZlibStream;
        Self {
            stream,
            encoding,
            compression,
            deflate: streaming.then(|| Compress::new(flate2::Compression::default(), true)),
            inflate: streaming.then(|| Decompress::new(true)),
            next_msgid: 0,
        }
    }

    /// Allocate the next request id for this connection.
    pub fn next_msgid(&mut self) -> u64 {
        self.next_msgid += 1;
        self.next_msgid
    }

    /// Send one message.
    pub fn send(&mut self, msg: &Msg) -> Result<()> {
        let raw = self.encode(msg)?;
        let packed = self.pack(&raw)?;
        write_frame(&mut self.stream, &packed)
    }

    /// Receive one message.
    pub fn recv(&mut self) -> Result<Msg> {
        let packed = read_frame(&mut self.stream)?;
        let raw = self.unpack(&packed)?;
        self.decode(&raw)
    }

    /// Stream one bulk chunk. Chunks must be non-empty; the empty frame is
    /// reserved as the stream terminator.
    pub fn send_bulk_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        debug_assert!(!chunk.is_empty());
        let packed = self.pack(chunk)?;
        write_frame(&mut self.stream, &packed)
    }

    /// Terminate a bulk stream and send its trailer.
    pub fn finish_bulk(&mut self, trailer: &BulkTrailer) -> Result<()> {
        write_frame(&mut self.stream, &[])?;
        let raw = self.encode_value(trailer)?;
        let packed = self.pack(&raw)?;
        write_frame(&mut self.stream, &packed)
    }

    /// Pump an entire reader through as a bulk stream (no trailer).
    /// Returns the raw byte count.
    pub fn send_bulk_from<R: Read>(&mut self, reader: &mut R) -> Result<u64> {
        let mut buf = vec![0u8; DATA_CHUNK];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.send_bulk_chunk(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Receive a bulk stream into `out`; returns the byte count and trailer.
    pub fn recv_bulk<W: Write>(&mut self, out: &mut W) -> Result<(u64, BulkTrailer)> {
        let mut total = 0u64;
        loop {
            let packed = read_frame(&mut self.stream)?;
            if packed.is_empty() {
                break;
            }
            let chunk = self.unpack(&packed)?;
            out.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        let packed = read_frame(&mut self.stream)?;
        let raw = self.unpack(&packed)?;
        let trailer: BulkTrailer = self.decode_value(&raw)?;
        Ok((total, trailer))
    }

    fn encode(&self, msg: &Msg) -> Result<Vec<u8>> {
        self.encode_value(msg)
    }

    fn encode_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::Json => {
                serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
            }
            Encoding::MsgPack => {
                rmp_serde::to_vec_named(value).map_err(|e| Error::Encode(e.to_string()))
            }
            Encoding::Bson => bson::to_vec(value).map_err(|e| Error::Encode(e.to_string())),
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Msg> {
        self.decode_value(raw)
    }

    fn decode_value<T: for<'de> Deserialize<'de>>(&self, raw: &[u8]) -> Result<T> {
        match self.encoding {
            Encoding::Json => {
                serde_json::from_slice(raw).map_err(|e| Error::Protocol(e.to_string()))
            }
            Encoding::MsgPack => {
                rmp_serde::from_slice(raw).map_err(|e| Error::Protocol(e.to_string()))
            }
            Encoding::Bson => {
                bson::from_slice(raw).map_err(|e| Error::Protocol(e.to_string()))
            }
        }
    }

    fn pack(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            TransportCompression::None => Ok(raw.to_vec()),
            TransportCompression::Zlib => {
                let mut enc =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(raw)?;
                Ok(enc.finish()?)
            }
            TransportCompression::ZlibStream => {
                let deflate = self.deflate.as_mut().expect("stream compressor");
                deflate_sync(deflate, raw)
            }
            TransportCompression::Snappy => snap::raw::Encoder::new()
                .compress_vec(raw)
                .map_err(|e| Error::Encode(e.to_string())),
        }
    }

    fn unpack(&mut self, packed: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            TransportCompression::None => Ok(packed.to_vec()),
            TransportCompression::Zlib => {
                let mut dec = flate2::read::ZlibDecoder::new(packed);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                Ok(out)
            }
            TransportCompression::ZlibStream => {
                let inflate = self.inflate.as_mut().expect("stream decompressor");
                inflate_sync(inflate, packed)
            }
            TransportCompression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(packed)
                .map_err(|e| Error::Protocol(e.to_string())),
        }
    }
}

fn deflate_sync(c: &mut Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut pos = 0usize;
    loop {
        if out.capacity() == out.len() {
            out.reserve(4096);
        }
        let before = c.total_in();
        c.compress_vec(&input[pos..], &mut out, FlushCompress::Sync)
            .map_err(|e| Error::Encode(format!("zlib: {e}")))?;
        pos += (c.total_in() - before) as usize;
        if pos >= input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
    }
}

fn inflate_sync(d: &mut Decompress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 2 + 64);
    let mut pos = 0usize;
    loop {
        if out.capacity() == out.len() {
            out.reserve(4096);
        }
        let before = d.total_in();
        d.decompress_vec(&input[pos..], &mut out, FlushDecompress::Sync)
            .map_err(|e| Error::Protocol(format!("zlib: {e}")))?;
        pos += (d.total_in() - before) as usize;
        if pos >= input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
    }
}

fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(Error::Protocol(format!("frame too large: {}", payload.len())));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())
        .map_err(map_io)?;
    w.write_all(payload).map_err(map_io)?;
    w.flush().map_err(map_io)?;
    Ok(())
}

fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).map_err(map_io)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!("frame too large: {len}")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(map_io)?;
    Ok(payload)
}

fn map_io(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
        std::io::ErrorKind::UnexpectedEof => Error::Protocol("connection closed".into()),
        _ => Error::Storage(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // A loopback stream: writes land in `wr`, reads drain `rd`.
    struct Loop {
        rd: Cursor<Vec<u8>>,
        wr: Vec<u8>,
    }
    impl Read for Loop {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.rd.read(buf)
        }
    }
    impl Write for Loop {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.wr.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn round_trip(encoding: Encoding, compression: TransportCompression) {
        let msg = Msg::DirHash { inode: (3, 4), hash: "abcd".into(), size: 12, msgid: Some(9) };
        let mut tx = Transport::negotiated(
            Loop { rd: Cursor::new(Vec::new()), wr: Vec::new() },
            encoding,
            compression,
        );
        tx.send(&msg).unwrap();
        let written = std::mem::take(&mut tx.stream.wr);
        let mut rx =
            Transport::negotiated(Loop { rd: Cursor::new(written), wr: Vec::new() }, encoding, compression);
        let got = rx.recv().unwrap();
        assert_eq!(got.tag(), "DHSH");
        assert_eq!(got.msgid(), Some(9));
    }

    #[test]
    fn round_trip_all_encodings() {
        for enc in [Encoding::Json, Encoding::MsgPack, Encoding::Bson] {
            round_trip(enc, TransportCompression::None);
        }
    }

    #[test]
    fn round_trip_all_compressions() {
        for comp in [
            TransportCompression::None,
            TransportCompression::Zlib,
            TransportCompression::ZlibStream,
            TransportCompression::Snappy,
        ] {
            round_trip(Encoding::Json, comp);
        }
    }

    #[test]
    fn bulk_stream_round_trip() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let mut tx = Transport::negotiated(
            Loop { rd: Cursor::new(Vec::new()), wr: Vec::new() },
            Encoding::Json,
            TransportCompression::Snappy,
        );
        let sent = tx.send_bulk_from(&mut Cursor::new(data.clone())).unwrap();
        tx.finish_bulk(&BulkTrailer {
            status: "OK".into(),
            size: sent,
            checksum: Some("ff".into()),
            compressed: None,
        })
        .unwrap();

        let written = std::mem::take(&mut tx.stream.wr);
        let mut rx = Transport::negotiated(
            Loop { rd: Cursor::new(written), wr: Vec::new() },
            Encoding::Json,
            TransportCompression::Snappy,
        );
        let mut out = Vec::new();
        let (n, trailer) = rx.recv_bulk(&mut out).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(trailer.size, sent);
        assert_eq!(trailer.checksum.as_deref(), Some("ff"));
    }

    #[test]
    fn handshake_rejects_unknown_encoding() {
        assert!(Encoding::from_token("XML").is_err());
        assert!(TransportCompression::from_token("lz4").is_err());
    }
}
