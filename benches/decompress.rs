//! Benchmarks for decoding, verification and key derivation.
//!
//! Run with: `cargo bench`
//! Compare with baseline: `cargo bench -- --save-baseline main`
//! Compare against baseline: `cargo bench -- --baseline main`
//!
//! Inputs are generated here: RAR5 streams with fixed-length Huffman
//! tables, and stored archives written header by header.

use std::io::{self, Read};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rar_extract::crypto::{Rar4Key, Rar5Key};
use rar_extract::decompress::{CompressionMethod, UnpackParams, Unpacker};
use rar_extract::parsing::Checksum;
use rar_extract::verify::Verifier;
use rar_extract::{Archive, FileMedia, MemoryMedia};

/// MSB-first bit writer.
struct BitWriter {
    bytes: Vec<u8>,
    bits: u64,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bits: 0,
        }
    }

    fn write(&mut self, value: u32, count: u32) {
        for i in (0..count).rev() {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if value >> i & 1 != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
        }
    }
}

enum Symbol {
    Literal(u8),
    /// Length slot 43 with 9 extra bits, plus the far-distance bonus.
    LongMatch { extra: u32, distance: u32 },
}

/// One RAR5 block: main/distance/low/repeat tables with 9/6/4/6-bit codes,
/// then `symbols`, marked as the last block.
fn rar5_block(symbols: &[Symbol]) -> Vec<u8> {
    let mut w = BitWriter::new();
    // Precode: lengths 4, 6 and 9 get the 2-bit codes 0, 1, 2
    for i in 0..20u32 {
        w.write(if matches!(i, 4 | 6 | 9) { 2 } else { 0 }, 4);
    }
    for (count, code) in [(306, 2), (64, 1), (16, 0), (44, 1)] {
        for _ in 0..count {
            w.write(code, 2);
        }
    }
    for symbol in symbols {
        match *symbol {
            Symbol::Literal(b) => w.write(u32::from(b), 9),
            Symbol::LongMatch { extra, distance } => {
                w.write(262 + 43, 9);
                w.write(extra, 9);
                let d = distance - 1;
                let dbits = 31 - d.leading_zeros() - 1;
                let slot = 2 * dbits + 2 + ((d >> dbits) & 1);
                w.write(slot, 6);
                let low = d - ((2 | (slot & 1)) << dbits);
                if dbits >= 4 {
                    w.write(low >> 4, dbits - 4);
                    w.write(low & 0xf, 4);
                } else {
                    w.write(low, dbits);
                }
            }
        }
    }

    let bit_size = ((w.bits - 1) % 8 + 1) as u8;
    let body = w.bytes;
    let size = (body.len() as u32).to_le_bytes();
    let flags = 0x80 | 0x40 | (2 << 3) | (bit_size - 1);
    let checksum = 0x5a ^ flags ^ size[0] ^ size[1] ^ size[2];
    let mut packed = vec![flags, checksum, size[0], size[1], size[2]];
    packed.extend_from_slice(&body);
    packed
}

fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn unpack(packed: &[u8], size: u64) -> io::Result<u64> {
    let params = UnpackParams {
        method: CompressionMethod::Lz5 { level: 3 },
        dict_size: 0x400000,
        unpacked_size: Some(size),
        solid_archive: false,
    };
    let mut unpacker = Unpacker::new(packed, params, None).map_err(io::Error::other)?;
    io::copy(&mut unpacker, &mut io::sink())
}

fn bench_rar5_literals(c: &mut Criterion) {
    let data = pseudo_random(256 * 1024);
    let symbols: Vec<_> = data.iter().map(|&b| Symbol::Literal(b)).collect();
    let packed = rar5_block(&symbols);

    let mut group = c.benchmark_group("decompress");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("rar5_literals", |b| {
        b.iter(|| unpack(black_box(&packed), data.len() as u64).unwrap());
    });
    group.finish();
}

fn bench_rar5_long_matches(c: &mut Criterion) {
    let seed = pseudo_random(1024);
    let mut symbols: Vec<_> = seed.iter().map(|&b| Symbol::Literal(b)).collect();
    let match_len = 2 + (7 << 9) + 511 + 1;
    let matches = 1024;
    symbols.extend((0..matches).map(|_| Symbol::LongMatch {
        extra: 511,
        distance: 1024,
    }));
    let packed = rar5_block(&symbols);
    let total = (seed.len() + matches * match_len) as u64;

    let mut group = c.benchmark_group("decompress");
    group.throughput(Throughput::Bytes(total));
    group.bench_function("rar5_long_matches", |b| {
        b.iter(|| unpack(black_box(&packed), total).unwrap());
    });
    group.finish();
}

fn vint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn rar5_header(header_type: u64, fields: &[u8], data_size: Option<u64>) -> Vec<u8> {
    let mut body = Vec::new();
    vint(header_type, &mut body);
    vint(if data_size.is_some() { 0x02 } else { 0 }, &mut body);
    if let Some(size) = data_size {
        vint(size, &mut body);
    }
    body.extend_from_slice(fields);
    let mut sized = Vec::new();
    vint(body.len() as u64, &mut sized);
    sized.extend_from_slice(&body);
    let mut out = crc32fast::hash(&sized).to_le_bytes().to_vec();
    out.extend_from_slice(&sized);
    out
}

/// A RAR5 archive of stored files.
fn stored_archive(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = b"Rar!\x1a\x07\x01\x00".to_vec();
    out.extend(rar5_header(1, &[0], None));
    for (name, data) in files {
        let mut fields = Vec::new();
        vint(0x04, &mut fields);
        vint(data.len() as u64, &mut fields);
        vint(0x20, &mut fields);
        fields.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        vint(0, &mut fields);
        vint(1, &mut fields);
        vint(name.len() as u64, &mut fields);
        fields.extend_from_slice(name.as_bytes());
        out.extend(rar5_header(2, &fields, Some(data.len() as u64)));
        out.extend_from_slice(data);
    }
    out.extend(rar5_header(5, &[0], None));
    out
}

fn bench_open_archive(c: &mut Criterion) {
    let files: Vec<_> = (0..1000)
        .map(|i| (format!("dir/file_{i:04}.txt"), vec![b'x'; 64]))
        .collect();
    let bytes: Arc<[u8]> = stored_archive(&files).into();

    c.bench_function("open_1000_entries", |b| {
        b.iter(|| {
            let media: Arc<dyn FileMedia> = Arc::new(MemoryMedia::new("bench.rar", bytes.clone()));
            let archive = Archive::open(media, None).unwrap();
            black_box(archive.entries().len())
        });
    });
}

fn bench_stored_extract(c: &mut Criterion) {
    let data = pseudo_random(4 * 1024 * 1024);
    let bytes: Arc<[u8]> = stored_archive(&[("big.bin".to_string(), data.clone())]).into();
    let media: Arc<dyn FileMedia> = Arc::new(MemoryMedia::new("bench.rar", bytes));
    let archive = Archive::open(media, None).unwrap();

    let mut group = c.benchmark_group("extract");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("stored_crc32", |b| {
        b.iter(|| {
            let mut reader = archive.open_entry(0, None).unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            loop {
                let n = reader.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            black_box(total)
        });
    });
    group.finish();
}

fn bench_blake2sp(c: &mut Criterion) {
    let data = pseudo_random(4 * 1024 * 1024);
    let mut group = c.benchmark_group("verify");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("blake2sp", |b| {
        b.iter(|| {
            // The digest never matches; only the hashing is measured
            let mut verifier = Verifier::new(Some(Checksum::Blake2sp([0; 32])), None);
            for chunk in data.chunks(64 * 1024) {
                verifier.update(chunk);
            }
            black_box(verifier.finish().is_err())
        });
    });
    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdf");
    group.sample_size(10);
    group.bench_function("rar4_sha1", |b| {
        b.iter(|| Rar4Key::derive(black_box("correct horse"), Some(&[7; 8])));
    });
    group.bench_function("rar5_pbkdf2_lg15", |b| {
        b.iter(|| Rar5Key::derive(black_box("correct horse"), &[7; 16], 15));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_rar5_literals,
    bench_rar5_long_matches,
    bench_open_archive,
    bench_stored_extract,
    bench_blake2sp,
    bench_key_derivation,
);
criterion_main!(benches);
