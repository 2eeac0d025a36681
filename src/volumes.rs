//! Volume file naming.
//!
//! Multi-volume archives use one of two naming schemes:
//!
//! | Scheme | First | Following |
//! |--------|-------|-----------|
//! | numbered parts | `name.part1.rar` | `name.part2.rar`, ... |
//! | extension | `name.rar` | `name.r00`, `name.r01`, ..., `name.r99`, `name.s00` |
//!
//! Digit width is kept (`part01` is followed by `part02`), letter case of
//! the extension too.

use std::path::{Path, PathBuf};

/// File name of the volume after `name`, or `None` when `name` follows
/// neither scheme.
pub fn next_volume_name(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    let (stem, ext) = lower.rsplit_once('.')?;
    let stem_len = stem.len();

    if ext == "rar" {
        if let Some(part) = stem.rfind(".part") {
            let digits = &name[part + 5..stem_len];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                let next = increment(digits).0;
                return Some(format!("{}{}{}", &name[..part + 5], next, &name[stem_len..]));
            }
        }
        let r = if name[stem_len + 1..].starts_with('R') { 'R' } else { 'r' };
        return Some(format!("{}.{r}00", &name[..stem_len]));
    }

    let letter = ext.chars().next()?;
    if ext.len() != 3 || !letter.is_ascii_lowercase() {
        return None;
    }
    let digits = &name[stem_len + 2..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let original = name[stem_len + 1..].chars().next()?;
    let (next, overflow) = increment(digits);
    let (letter, digits) = if overflow {
        let bumped = char::from(original as u8 + 1);
        (bumped, "0".repeat(digits.len()))
    } else {
        (original, next)
    };
    if !letter.is_ascii_alphabetic() {
        return None;
    }
    Some(format!("{}.{letter}{digits}", &name[..stem_len]))
}

/// Path of the volume after `path`, in the same directory.
pub fn next_volume_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(next_volume_name(name)?))
}

/// Add one to a decimal string, keeping its width. The flag is set when
/// the result needs an extra digit.
fn increment(digits: &str) -> (String, bool) {
    let width = digits.len();
    let value = digits.parse::<u64>().unwrap_or(0) + 1;
    let next = format!("{value:0width$}");
    let overflow = next.len() > width;
    (next, overflow)
}
