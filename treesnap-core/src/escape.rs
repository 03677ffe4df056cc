//! Byte-exact escaping of filesystem names for the text manifest.
//!
//! Names are raw bytes. Anything outside `[A-Za-z0-9+,./:@_-]` is written as
//! `\NNN`, the three-digit octal value of the byte, so names that are not
//! valid UTF-8 survive the trip through a text file unchanged.

use anyhow::{bail, Result};
use std::fmt::Write;

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"+,./:@_-".contains(&b)
}

/// Escape raw bytes for use as a manifest path or link target.
pub fn escape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if is_plain(b) {
            out.push(b as char);
        } else {
            // Writing to a String cannot fail.
            let _ = write!(out, "\\{:03o}", b);
        }
    }
    out
}

/// Reverse [`escape`]. Also accepts the short mtree escapes `\\`, `\s`,
/// `\t`, `\n` and `\r` that other mtree writers produce.
pub fn unescape(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        let Some(&next) = bytes.get(i + 1) else {
            bail!("dangling backslash at end of {:?}", text);
        };
        match next {
            b'0'..=b'3' => {
                let digits = bytes.get(i + 1..i + 4).unwrap_or(&[]);
                if digits.len() != 3 || !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                    bail!("bad octal escape at offset {} in {:?}", i, text);
                }
                let v = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(v as u8);
                i += 4;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b's' => {
                out.push(b' ');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            other => bail!("unknown escape \\{} in {:?}", other as char, text),
        }
    }
    Ok(out)
}

/// Why a name would cause trouble on case-insensitive or restricted
/// filesystems. Purely advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonPortable {
    /// One of `<>:"\|?*`.
    ReservedCharacter(u8),
    /// A byte below 0x20.
    ControlByte(u8),
    /// The name is not valid UTF-8.
    NotUtf8,
}

impl std::fmt::Display for NonPortable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NonPortable::ReservedCharacter(c) => write!(f, "reserved character {:?}", *c as char),
            NonPortable::ControlByte(c) => write!(f, "control byte 0x{:02x}", c),
            NonPortable::NotUtf8 => f.write_str("not valid UTF-8"),
        }
    }
}

/// Check a single path component.
pub fn non_portable(name: &[u8]) -> Option<NonPortable> {
    if let Some(&c) = name.iter().find(|c| b"<>:\"\\|?*".contains(c)) {
        return Some(NonPortable::ReservedCharacter(c));
    }
    if let Some(&c) = name.iter().find(|&&c| c < 0x20) {
        return Some(NonPortable::ControlByte(c));
    }
    if std::str::from_utf8(name).is_err() {
        return Some(NonPortable::NotUtf8);
    }
    None
}

/// Key under which two names collide on a case-insensitive filesystem.
pub fn case_fold(name: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(name) {
        Ok(s) => s.to_lowercase().into_bytes(),
        Err(_) => name.to_ascii_lowercase(),
    }
}
