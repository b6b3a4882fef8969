//! Rolling-signature delta codec.
//!
//! Three operations over byte streams, none of which require the full file
//! in memory:
//!
//! - [`signature`]: per-block rolling + strong checksums of a basis stream,
//!   plus a digest identifying the basis itself.
//! - [`delta`]: copy/literal op stream transforming the basis into a target,
//!   found by sliding a rolling checksum over the target.
//! - [`patch`]: applies a delta to a basis, refusing a basis whose digest
//!   does not match the one recorded in the delta.
//!
//! `patch(b, delta(t, signature(b)))` reproduces `t` byte for byte.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};
use tempfile::SpooledTempFile;
use thiserror::Error;

/// Signature stream magic.
const SIG_MAGIC: [u8; 4] = *b"RSG1";
/// Delta stream magic.
const DELTA_MAGIC: [u8; 4] = *b"RDL1";

/// Default block granularity for signatures.
pub const DEFAULT_BLOCK: u32 = 2048;
/// Bytes of truncated SHA-256 kept per block.
const STRONG_LEN: usize = 16;
/// Bytes of truncated SHA-256 identifying the basis stream.
const BASIS_ID_LEN: usize = 16;

/// Delta ops spill to disk past this size.
const SPOOL_LIMIT: usize = 1024 * 1024;

const OP_END: u8 = 0;
const OP_LITERAL: u8 = 1;
const OP_COPY: u8 = 2;

/// Flush accumulated literal bytes at this bound.
const LITERAL_FLUSH: usize = 64 * 1024;

/// Codec failures.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt stream: {0}")]
    Corrupt(String),
    #[error("delta applied to the wrong basis")]
    BasisMismatch,
}

// rsync-style rolling checksum over a fixed window
#[derive(Clone, Copy, Default)]
struct Rolling {
    a: u32,
    b: u32,
}

impl Rolling {
    fn of(block: &[u8]) -> Self {
        let mut r = Rolling::default();
        let len = block.len() as u32;
        for (i, &x) in block.iter().enumerate() {
            r.a = r.a.wrapping_add(x as u32);
            r.b = r.b.wrapping_add((len - i as u32).wrapping_mul(x as u32));
        }
        r.a &= 0xffff;
        r.b &= 0xffff;
        r
    }

    fn roll(&mut self, out: u8, inp: u8, len: usize) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inp as u32) & 0xffff;
        self.b = self
            .b
            .wrapping_sub((len as u32).wrapping_mul(out as u32))
            .wrapping_add(self.a)
            & 0xffff;
    }

    fn digest(self) -> u32 {
        self.a | (self.b << 16)
    }
}

fn strong_sum(block: &[u8]) -> [u8; STRONG_LEN] {
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&Sha256::digest(block)[..STRONG_LEN]);
    out
}

/// Generate the signature of a basis stream. Signatures are small
/// (about 20 bytes per block) and returned in memory.
pub fn signature<R: Read>(mut basis: R) -> Result<Vec<u8>, DeltaError> {
    signature_with_block(&mut basis, DEFAULT_BLOCK)
}

/// Signature with an explicit block size (tests exercise odd sizes).
pub fn signature_with_block<R: Read>(basis: &mut R, block_size: u32) -> Result<Vec<u8>, DeltaError> {
    let mut b = SignatureBuilder::with_block(block_size)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = basis.read(&mut buf)?;
        if n == 0 {
            break;
        }
        b.update(&buf[..n]);
    }
    Ok(b.finish())
}

/// Incremental signature construction for callers that push bytes while
/// doing other work with them (hashing, sending).
pub struct SignatureBuilder {
    block_size: u32,
    blocks: Vec<(u32, [u8; STRONG_LEN])>,
    basis_hash: Sha256,
    basis_len: u64,
    pending: Vec<u8>,
}

impl SignatureBuilder {
    pub fn new() -> Self {
        Self::with_block(DEFAULT_BLOCK).expect("default block size is valid")
    }

    pub fn with_block(block_size: u32) -> Result<Self, DeltaError> {
        if block_size == 0 {
            return Err(DeltaError::Corrupt("zero block size".into()));
        }
        Ok(Self {
            block_size,
            blocks: Vec::new(),
            basis_hash: Sha256::new(),
            basis_len: 0,
            pending: Vec::new(),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.basis_hash.update(data);
        self.basis_len += data.len() as u64;
        self.pending.extend_from_slice(data);
        let bs = self.block_size as usize;
        while self.pending.len() >= bs {
            let block: Vec<u8> = self.pending.drain(..bs).collect();
            self.blocks
                .push((Rolling::of(&block).digest(), strong_sum(&block)));
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.pending.is_empty() {
            self.blocks
                .push((Rolling::of(&self.pending).digest(), strong_sum(&self.pending)));
        }
        let mut out = Vec::with_capacity(41 + self.blocks.len() * (4 + STRONG_LEN));
        out.extend_from_slice(&SIG_MAGIC);
        out.extend_from_slice(&self.block_size.to_be_bytes());
        out.push(STRONG_LEN as u8);
        out.extend_from_slice(&(self.blocks.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.basis_len.to_be_bytes());
        out.extend_from_slice(&Sha256::finalize(self.basis_hash)[..BASIS_ID_LEN]);
        for (weak, strong) in &self.blocks {
            out.extend_from_slice(&weak.to_be_bytes());
            out.extend_from_slice(strong);
        }
        out
    }
}

impl Default for SignatureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed signature, indexed for delta generation.
pub struct SignatureIndex {
    block_size: u32,
    basis_len: u64,
    basis_id: [u8; BASIS_ID_LEN],
    // weak checksum -> candidate (block index, strong sum)
    by_weak: HashMap<u32, Vec<(u64, [u8; STRONG_LEN])>>,
    nblocks: u64,
}

impl SignatureIndex {
    pub fn parse<R: Read>(mut sig: R) -> Result<Self, DeltaError> {
        let mut header = [0u8; 4 + 4 + 1 + 8 + 8 + BASIS_ID_LEN];
        sig.read_exact(&mut header)
            .map_err(|_| DeltaError::Corrupt("signature header truncated".into()))?;
        if header[..4] != SIG_MAGIC {
            return Err(DeltaError::Corrupt("bad signature magic".into()));
        }
        let block_size = u32::from_be_bytes(header[4..8].try_into().expect("fixed slice"));
        let strong_len = header[8] as usize;
        if block_size == 0 || strong_len != STRONG_LEN {
            return Err(DeltaError::Corrupt("unsupported signature parameters".into()));
        }
        let nblocks = u64::from_be_bytes(header[9..17].try_into().expect("fixed slice"));
        let basis_len = u64::from_be_bytes(header[17..25].try_into().expect("fixed slice"));
        let mut basis_id = [0u8; BASIS_ID_LEN];
        basis_id.copy_from_slice(&header[25..25 + BASIS_ID_LEN]);

        let mut by_weak: HashMap<u32, Vec<(u64, [u8; STRONG_LEN])>> = HashMap::new();
        let mut rec = [0u8; 4 + STRONG_LEN];
        for idx in 0..nblocks {
            sig.read_exact(&mut rec)
                .map_err(|_| DeltaError::Corrupt("signature blocks truncated".into()))?;
            let weak = u32::from_be_bytes(rec[..4].try_into().expect("fixed slice"));
            let mut strong = [0u8; STRONG_LEN];
            strong.copy_from_slice(&rec[4..]);
            by_weak.entry(weak).or_default().push((idx, strong));
        }
        Ok(Self { block_size, basis_len, basis_id, by_weak, nblocks })
    }

    fn block_len(&self, idx: u64) -> u64 {
        if idx + 1 < self.nblocks {
            self.block_size as u64
        } else {
            // final block carries the remainder
            let rem = self.basis_len - (self.nblocks - 1) * self.block_size as u64;
            if rem == 0 {
                self.block_size as u64
            } else {
                rem
            }
        }
    }

    fn lookup(&self, weak: u32, window: &[u8]) -> Option<u64> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = strong_sum(window);
        candidates
            .iter()
            .find(|(idx, s)| *s == strong && self.block_len(*idx) == window.len() as u64)
            .map(|(idx, _)| *idx)
    }
}

struct OpWriter {
    out: SpooledTempFile,
    literal: Vec<u8>,
    // coalesced copy run
    copy_start: u64,
    copy_len: u64,
    size: u64,
}

impl OpWriter {
    fn new() -> Self {
        Self {
            out: SpooledTempFile::new(SPOOL_LIMIT),
            literal: Vec::new(),
            copy_start: 0,
            copy_len: 0,
            size: 0,
        }
    }

    fn push_literal(&mut self, byte: u8) -> Result<(), DeltaError> {
        self.flush_copy()?;
        self.literal.push(byte);
        if self.literal.len() >= LITERAL_FLUSH {
            self.flush_literal()?;
        }
        Ok(())
    }

    fn push_literal_slice(&mut self, bytes: &[u8]) -> Result<(), DeltaError> {
        self.flush_copy()?;
        self.literal.extend_from_slice(bytes);
        if self.literal.len() >= LITERAL_FLUSH {
            self.flush_literal()?;
        }
        Ok(())
    }

    fn push_copy(&mut self, offset: u64, len: u64) -> Result<(), DeltaError> {
        self.flush_literal()?;
        if self.copy_len > 0 && self.copy_start + self.copy_len == offset {
            self.copy_len += len;
        } else {
            self.flush_copy()?;
            self.copy_start = offset;
            self.copy_len = len;
        }
        Ok(())
    }

    fn flush_literal(&mut self) -> Result<(), DeltaError> {
        if !self.literal.is_empty() {
            self.out.write_all(&[OP_LITERAL])?;
            self.out.write_all(&(self.literal.len() as u32).to_be_bytes())?;
            self.out.write_all(&self.literal)?;
            self.size += 5 + self.literal.len() as u64;
            self.literal.clear();
        }
        Ok(())
    }

    fn flush_copy(&mut self) -> Result<(), DeltaError> {
        if self.copy_len > 0 {
            self.out.write_all(&[OP_COPY])?;
            self.out.write_all(&self.copy_start.to_be_bytes())?;
            self.out.write_all(&self.copy_len.to_be_bytes())?;
            self.size += 17;
            self.copy_start = 0;
            self.copy_len = 0;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(SpooledTempFile, u64), DeltaError> {
        self.flush_literal()?;
        self.flush_copy()?;
        self.out.write_all(&[OP_END])?;
        self.size += 1;
        self.out.seek(SeekFrom::Start(0))?;
        Ok((self.out, self.size))
    }
}

/// Generate a delta transforming the signature's basis into `target`.
/// Returns a rewound reader over the delta stream and the op-stream size.
pub fn delta<R: Read>(
    mut target: R,
    sig: &SignatureIndex,
) -> Result<(SpooledTempFile, u64), DeltaError> {
    let bs = sig.block_size as usize;
    let mut ops = OpWriter::new();
    ops.out.write_all(&DELTA_MAGIC)?;
    ops.out.write_all(&sig.basis_id)?;
    ops.out.write_all(&sig.block_size.to_be_bytes())?;
    ops.size = 4 + BASIS_ID_LEN as u64 + 4;

    // window buffer; compacted when the leading slack grows
    let mut buf: Vec<u8> = Vec::with_capacity(bs * 16);
    let mut start = 0usize;
    let mut eof = false;
    let mut rolling: Option<Rolling> = None;

    loop {
        // ensure a full block (or the final tail) is buffered
        while !eof && buf.len() - start < bs {
            let mut chunk = vec![0u8; bs * 8];
            let n = target.read(&mut chunk)?;
            if n == 0 {
                eof = true;
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }
        }
        let avail = buf.len() - start;
        if avail == 0 {
            break;
        }
        if avail < bs {
            // tail shorter than a block: try to match it against the final
            // basis block, else it is a literal
            let window = &buf[start..];
            let weak = Rolling::of(window).digest();
            if let Some(idx) = sig.lookup(weak, window) {
                ops.push_copy(idx * sig.block_size as u64, window.len() as u64)?;
            } else {
                ops.push_literal_slice(window)?;
            }
            break;
        }

        let window = &buf[start..start + bs];
        let weak = match rolling {
            Some(r) => r,
            None => Rolling::of(window),
        };
        if let Some(idx) = sig.lookup(weak.digest(), window) {
            ops.push_copy(idx * sig.block_size as u64, bs as u64)?;
            start += bs;
            rolling = None;
        } else {
            ops.push_literal(buf[start])?;
            if buf.len() - start > bs {
                let mut r = weak;
                r.roll(buf[start], buf[start + bs], bs);
                rolling = Some(r);
            } else {
                rolling = None;
            }
            start += 1;
        }

        // compact the buffer once the dead prefix dominates
        if start >= bs * 8 {
            buf.drain(..start);
            start = 0;
        }
    }

    ops.finish()
}

/// Apply `delta_stream` to `basis`, producing a rewound reader over the
/// patched bytes. The basis is spooled to scratch for random access and its
/// digest checked against the delta's self-identifier.
pub fn patch<B: Read, D: Read>(
    mut basis: B,
    mut delta_stream: D,
) -> Result<SpooledTempFile, DeltaError> {
    // spool basis, hashing as we go
    let mut spool = SpooledTempFile::new(SPOOL_LIMIT);
    let mut hash = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = basis.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
        spool.write_all(&buf[..n])?;
    }
    let basis_id = &Sha256::finalize(hash)[..BASIS_ID_LEN];

    let mut header = [0u8; 4 + BASIS_ID_LEN + 4];
    delta_stream
        .read_exact(&mut header)
        .map_err(|_| DeltaError::Corrupt("delta header truncated".into()))?;
    if header[..4] != DELTA_MAGIC {
        return Err(DeltaError::Corrupt("bad delta magic".into()));
    }
    if &header[4..4 + BASIS_ID_LEN] != basis_id {
        return Err(DeltaError::BasisMismatch);
    }

    let basis_len = spool.seek(SeekFrom::End(0))?;
    let mut out = SpooledTempFile::new(SPOOL_LIMIT);
    loop {
        let mut op = [0u8; 1];
        delta_stream
            .read_exact(&mut op)
            .map_err(|_| DeltaError::Corrupt("delta ops truncated".into()))?;
        match op[0] {
            OP_END => break,
            OP_LITERAL => {
                let mut len_buf = [0u8; 4];
                delta_stream.read_exact(&mut len_buf)?;
                let mut remaining = u32::from_be_bytes(len_buf) as usize;
                while remaining > 0 {
                    let take = remaining.min(buf.len());
                    delta_stream.read_exact(&mut buf[..take])?;
                    out.write_all(&buf[..take])?;
                    remaining -= take;
                }
            }
            OP_COPY => {
                let mut hdr = [0u8; 16];
                delta_stream.read_exact(&mut hdr)?;
                let offset = u64::from_be_bytes(hdr[..8].try_into().expect("fixed slice"));
                let len = u64::from_be_bytes(hdr[8..].try_into().expect("fixed slice"));
                if offset + len > basis_len {
                    return Err(DeltaError::Corrupt("copy beyond basis".into()));
                }
                spool.seek(SeekFrom::Start(offset))?;
                let mut remaining = len as usize;
                while remaining > 0 {
                    let take = remaining.min(buf.len());
                    spool.read_exact(&mut buf[..take])?;
                    out.write_all(&buf[..take])?;
                    remaining -= take;
                }
            }
            other => return Err(DeltaError::Corrupt(format!("unknown op {other}"))),
        }
    }
    out.seek(SeekFrom::Start(0))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run_round_trip(basis: &[u8], target: &[u8]) -> u64 {
        let sig = signature(Cursor::new(basis)).unwrap();
        let index = SignatureIndex::parse(Cursor::new(&sig)).unwrap();
        let (mut d, dsize) = delta(Cursor::new(target), &index).unwrap();
        let mut patched = patch(Cursor::new(basis), &mut d).unwrap();
        let mut got = Vec::new();
        patched.read_to_end(&mut got).unwrap();
        assert_eq!(got, target);
        dsize
    }

    fn pseudo(len: usize, seed: u8) -> Vec<u8> {
        let mut v = Vec::with_capacity(len);
        let mut x = seed as u32;
        for _ in 0..len {
            x = x.wrapping_mul(1103515245).wrapping_add(12345);
            v.push((x >> 16) as u8);
        }
        v
    }

    #[test]
    fn identical_streams_make_tiny_deltas() {
        let data = pseudo(100_000, 1);
        let dsize = run_round_trip(&data, &data);
        // pure copy run: header + one coalesced copy + end
        assert!(dsize < 64, "delta size {dsize}");
    }

    #[test]
    fn append_only_change() {
        let mut basis = pseudo(50_000, 2);
        let mut target = basis.clone();
        target.extend(pseudo(4_000, 3));
        let dsize = run_round_trip(&basis, &target);
        assert!(dsize < 6_000, "delta size {dsize}");
        // and the reverse: truncation
        basis.truncate(20_000);
        run_round_trip(&target, &basis);
    }

    #[test]
    fn edit_in_the_middle() {
        let basis = pseudo(80_000, 4);
        let mut target = basis.clone();
        for b in &mut target[40_000..40_100] {
            *b ^= 0xAA;
        }
        let dsize = run_round_trip(&basis, &target);
        assert!(dsize < 10_000, "delta size {dsize}");
    }

    #[test]
    fn unrelated_streams_still_patch() {
        let basis = pseudo(10_000, 5);
        let target = pseudo(12_345, 6);
        run_round_trip(&basis, &target);
    }

    #[test]
    fn boundary_sizes() {
        let bs = DEFAULT_BLOCK as usize;
        for size in [0usize, 1, bs - 1, bs, bs + 1, 4096] {
            let basis = pseudo(size, 7);
            let target = pseudo(size, 8);
            run_round_trip(&basis, &target);
            run_round_trip(&basis, &basis);
        }
    }

    #[test]
    fn empty_basis() {
        let target = pseudo(5_000, 9);
        run_round_trip(&[], &target);
        run_round_trip(&target, &[]);
    }

    #[test]
    fn wrong_basis_rejected() {
        let basis = pseudo(10_000, 10);
        let other = pseudo(10_000, 11);
        let sig = signature(Cursor::new(&basis)).unwrap();
        let index = SignatureIndex::parse(Cursor::new(&sig)).unwrap();
        let (mut d, _) = delta(Cursor::new(pseudo(9_000, 12)), &index).unwrap();
        let err = patch(Cursor::new(&other), &mut d).unwrap_err();
        assert!(matches!(err, DeltaError::BasisMismatch));
    }

    #[test]
    fn builder_matches_one_shot_signature() {
        let data = pseudo(10_000, 20);
        let one_shot = signature(Cursor::new(&data)).unwrap();
        let mut b = SignatureBuilder::new();
        for chunk in data.chunks(777) {
            b.update(chunk);
        }
        assert_eq!(b.finish(), one_shot);
    }

    #[test]
    fn signature_parse_rejects_garbage() {
        assert!(SignatureIndex::parse(Cursor::new(b"nonsense")).is_err());
        let mut sig = signature(Cursor::new(b"hello world")).unwrap();
        sig[0] ^= 0xFF;
        assert!(SignatureIndex::parse(Cursor::new(&sig)).is_err());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn round_trip_holds_for_arbitrary_streams(
            basis in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..20_000),
            target in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..20_000),
        ) {
            run_round_trip(&basis, &target);
        }
    }
}
