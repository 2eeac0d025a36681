#![no_main]
use std::io;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use rar_extract::{Archive, FileMedia, MemoryMedia};

fuzz_target!(|data: &[u8]| {
    // First byte picks whether a password is offered
    let Some((&mode, bytes)) = data.split_first() else {
        return;
    };
    let password = (mode & 1 == 1).then_some("fuzz");
    let media: Arc<dyn FileMedia> = Arc::new(MemoryMedia::new("fuzz.rar", bytes.to_vec()));
    let Ok(archive) = Archive::open(media, password) else {
        return;
    };
    let mut carry = None;
    for index in 0..archive.entries().len() {
        let Ok(mut reader) = archive.open_entry(index, carry.take()) else {
            continue;
        };
        // Cap output per entry; declared sizes are attacker controlled
        let mut limited = io::Read::take(&mut reader, 16 * 1024 * 1024);
        if io::copy(&mut limited, &mut io::sink()).is_ok() {
            carry = reader.into_lz_state();
        }
    }
});
