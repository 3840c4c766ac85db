// Copyright 2023 Balázs Dukai, Ravi Peters
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Output formats for the tiles.
//! All binary formats are little-endian and 8-byte aligned.
use std::fs;
use std::io::Write;
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

pub mod cesium3dtiles;
pub mod container;
pub mod subtree;

/// Padding of JSON and URI sections.
pub(crate) const JSON_PADDING: u8 = b' ';
/// Padding of binary sections.
pub(crate) const BINARY_PADDING: u8 = 0;

/// Pads `buffer` with `padding` until `offset + buffer.len()` is a multiple of 8.
/// `offset` is the position of the buffer's first byte in the file.
pub(crate) fn pad_to_8(buffer: &mut Vec<u8>, offset: usize, padding: u8) {
    let remainder = (offset + buffer.len()) % 8;
    if remainder != 0 {
        buffer.resize(buffer.len() + 8 - remainder, padding);
    }
}

/// Converts a length to a 32-bit length field, failing instead of truncating.
pub(crate) fn length_u32(field: &'static str, length: usize) -> Result<u32> {
    u32::try_from(length).map_err(|_| Error::LengthOverflow { field, length })
}

/// Writes the file to a temporary file next to `path` and renames it, so that an
/// interrupted write never leaves a partial file under the final name.
pub fn write_atomically<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_error = |source: std::io::Error| Error::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(write_error)?;
    let mut file = NamedTempFile::new_in(dir).map_err(write_error)?;
    file.write_all(bytes).map_err(write_error)?;
    file.persist(path).map_err(|e| write_error(e.error))?;
    debug!("Wrote {:?} ({} bytes)", path, bytes.len());
    Ok(())
}
