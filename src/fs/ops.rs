use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};

use util::PathEncodingError;

use super::Error;

/// Copy a regular file; symlinks are followed.
pub fn copy(src: &Path, tgt: &Path) -> Result<()> {
    if !src.is_file() {
        return Err(Error::NotFile(src.to_str().ok_or(PathEncodingError)?.to_owned()).into());
    }
    fs::copy(src, tgt)?;
    Ok(())
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// true if both files exist and hold the same bytes.
pub fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    if !a.is_file() || !b.is_file() {
        return Ok(false);
    }
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(file_digest(a)? == file_digest(b)?)
}
