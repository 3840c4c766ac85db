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
//! Binary [subtree files](https://github.com/CesiumGS/3d-tiles/tree/main/specification/ImplicitTiling#subtree-binary-format)
//! of implicit tiling.
//!
//! A 24-byte header (`subt`, version, JSON length, binary length) is followed by the
//! subtree JSON and the binary buffer that holds the availability bitstreams.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::formats::{pad_to_8, BINARY_PADDING, JSON_PADDING};

const HEADER_LENGTH: usize = 24;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct SubtreeHeader {
    magic: [u8; 4],
    version: u32,
    json_byte_length: u64,
    binary_byte_length: u64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubtreeJson {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    buffers: Vec<Buffer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    buffer_views: Vec<BufferView>,
    tile_availability: Availability,
    content_availability: Vec<Availability>,
    child_subtree_availability: Availability,
}

impl SubtreeJson {
    pub fn tile_availability(&self) -> &Availability {
        &self.tile_availability
    }

    pub fn content_availability(&self) -> &[Availability] {
        &self.content_availability
    }

    pub fn child_subtree_availability(&self) -> &Availability {
        &self.child_subtree_availability
    }

    /// Byte range of a buffer view within the binary chunk.
    pub fn buffer_view_range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        self.buffer_views
            .get(index)
            .map(|v| v.byte_offset..v.byte_offset + v.byte_length)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Buffer {
    byte_length: usize,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: usize,
    byte_offset: usize,
    byte_length: usize,
}

/// Availability of one bitstream. A bitstream without any set bit is written as a
/// constant instead of a buffer view.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Availability {
    Bitstream {
        bitstream: usize,
        #[serde(rename = "availableCount")]
        available_count: usize,
    },
    Constant {
        constant: u8,
    },
}

/// A bitstream and its number of set bits.
#[derive(Debug, Clone, Copy)]
pub struct Bitstream<'a> {
    pub bytes: &'a [u8],
    pub available_count: usize,
}

impl<'a> Bitstream<'a> {
    pub fn new(bytes: &'a [u8], available_count: usize) -> Self {
        Self {
            bytes,
            available_count,
        }
    }
}

/// Collects the bitstreams into the binary chunk, each one in its own buffer view.
#[derive(Default)]
struct BinaryChunk {
    binary: Vec<u8>,
    views: Vec<BufferView>,
}

impl BinaryChunk {
    fn add(&mut self, bitstream: Bitstream) -> Availability {
        if bitstream.available_count == 0 {
            return Availability::Constant { constant: 0 };
        }
        let byte_offset = self.binary.len();
        self.binary.extend_from_slice(bitstream.bytes);
        let byte_length = bitstream.bytes.len();
        pad_to_8(&mut self.binary, 0, BINARY_PADDING);
        self.views.push(BufferView {
            buffer: 0,
            byte_offset,
            byte_length,
        });
        Availability::Bitstream {
            bitstream: self.views.len() - 1,
            available_count: bitstream.available_count,
        }
    }
}

/// Encodes a subtree file with the tile availability, one content availability per
/// content of the tiles and the child subtree availability.
pub fn to_bytes(
    tile: Bitstream,
    contents: &[Bitstream],
    child_subtree: Bitstream,
) -> Result<Vec<u8>> {
    let mut chunk = BinaryChunk::default();
    let tile_availability = chunk.add(tile);
    let content_availability = contents.iter().map(|c| chunk.add(*c)).collect();
    let child_subtree_availability = chunk.add(child_subtree);
    let buffers = if chunk.binary.is_empty() {
        Vec::new()
    } else {
        vec![Buffer {
            byte_length: chunk.binary.len(),
        }]
    };
    let subtree = SubtreeJson {
        buffers,
        buffer_views: chunk.views,
        tile_availability,
        content_availability,
        child_subtree_availability,
    };
    let mut json = serde_json::to_vec(&subtree)?;
    pad_to_8(&mut json, HEADER_LENGTH, JSON_PADDING);

    let header = SubtreeHeader {
        magic: *b"subt",
        version: 1,
        json_byte_length: json.len() as u64,
        binary_byte_length: chunk.binary.len() as u64,
    };
    let mut bytes = bincode::serialize(&header)?;
    bytes.reserve(json.len() + chunk.binary.len());
    bytes.append(&mut json);
    bytes.append(&mut chunk.binary);
    Ok(bytes)
}

/// Splits a subtree file into its JSON and binary chunk.
pub fn parse(bytes: &[u8]) -> Result<(SubtreeJson, &[u8])> {
    let header_bytes = bytes
        .get(0..HEADER_LENGTH)
        .ok_or_else(|| Error::Malformed(format!("subtree of {} bytes", bytes.len())))?;
    let header: SubtreeHeader = bincode::deserialize(header_bytes)?;
    if &header.magic != b"subt" {
        return Err(Error::Malformed("not a subtree file".to_string()));
    }
    let json_end = HEADER_LENGTH + header.json_byte_length as usize;
    let binary_end = json_end + header.binary_byte_length as usize;
    let json = bytes
        .get(HEADER_LENGTH..json_end)
        .ok_or_else(|| Error::Malformed("truncated subtree JSON".to_string()))?;
    let binary = bytes
        .get(json_end..binary_end)
        .ok_or_else(|| Error::Malformed("truncated subtree binary".to_string()))?;
    Ok((serde_json::from_slice(json)?, binary))
}
