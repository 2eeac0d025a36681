#![no_main]
use std::io;

use libfuzzer_sys::fuzz_target;
use rar_extract::decompress::{CompressionMethod, UnpackParams, Unpacker};

fuzz_target!(|data: &[u8]| {
    if data.len() < 6 {
        return;
    }

    // First 4 bytes: unpacked size, capped to 16MB
    let unpacked_size = u64::from(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
        % (16 * 1024 * 1024);
    // Byte 4: dictionary size as a power of two, 17-22
    let dict_size = 1u64 << (17 + data[4] % 6);
    // Byte 5: compression level 1-5
    let level = 1 + data[5] % 5;

    let params = UnpackParams {
        method: CompressionMethod::Lz5 { level },
        dict_size,
        unpacked_size: Some(unpacked_size),
        solid_archive: false,
    };
    let Ok(mut unpacker) = Unpacker::new(&data[6..], params, None) else {
        return;
    };
    let _ = io::copy(&mut unpacker, &mut io::sink());
});
