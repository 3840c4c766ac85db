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
//! Binary tile containers of [3D Tiles 1.0](https://github.com/CesiumGS/3d-tiles/tree/main/specification/TileFormats):
//! Batched 3D Model (`b3dm`), Instanced 3D Model (`i3dm`) and Composite (`cmpt`).
//!
//! A container is a fixed header followed by the feature table (JSON and binary), the
//! batch table (JSON and binary) and the glTF payload. Every section ends on an 8-byte
//! boundary of the file. JSON is padded with spaces, binary with zeros.
//! The headers are serialized with bincode, which writes the fields in declaration
//! order as little-endian fixed-width integers, exactly the layout of the format.
use std::collections::BTreeMap;

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::formats::{length_u32, pad_to_8, BINARY_PADDING, JSON_PADDING};

const VERSION: u32 = 1;
const B3DM_HEADER_LENGTH: usize = 28;
const I3DM_HEADER_LENGTH: usize = 32;
const CMPT_HEADER_LENGTH: usize = 16;

/// Byte lengths of the feature and batch tables, including their padding.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TableLengths {
    pub feature_table_json: u32,
    pub feature_table_binary: u32,
    pub batch_table_json: u32,
    pub batch_table_binary: u32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct B3dmHeader {
    magic: [u8; 4],
    version: u32,
    byte_length: u32,
    tables: TableLengths,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct I3dmHeader {
    magic: [u8; 4],
    version: u32,
    byte_length: u32,
    tables: TableLengths,
    gltf_format: u32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct CmptHeader {
    magic: [u8; 4],
    version: u32,
    byte_length: u32,
    tiles_length: u32,
}

/// How the glTF of an instanced model is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Embedded binary glTF.
    Binary(Vec<u8>),
    /// URI of an external glTF, padded with spaces like JSON.
    Uri(String),
}

impl Payload {
    fn gltf_format(&self) -> u32 {
        match self {
            Payload::Uri(_) => 0,
            Payload::Binary(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Batched,
    Instanced,
}

impl ContainerKind {
    pub fn magic(&self) -> &'static [u8; 4] {
        match self {
            ContainerKind::Batched => b"b3dm",
            ContainerKind::Instanced => b"i3dm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::Batched => "b3dm",
            ContainerKind::Instanced => "i3dm",
        }
    }

    fn header_length(&self) -> usize {
        match self {
            ContainerKind::Batched => B3DM_HEADER_LENGTH,
            ContainerKind::Instanced => I3DM_HEADER_LENGTH,
        }
    }
}

/// Per-feature properties, one array per property. Becomes the batch table JSON.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(transparent)]
pub struct BatchTable {
    columns: BTreeMap<String, Vec<Value>>,
}

impl BatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property. All properties must have one value per feature.
    pub fn insert_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if let Some(length) = self.columns.values().next().map(Vec::len) {
            if length != values.len() {
                return Err(Error::Malformed(format!(
                    "batch table property {} has {} values instead of {}",
                    name,
                    values.len(),
                    length
                )));
            }
        }
        self.columns.insert(name.to_string(), values);
        Ok(())
    }

    /// Number of features.
    pub fn len(&self) -> usize {
        self.columns.values().next().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Placement of the instances of an instanced model. Read from the
/// `<tile>.instances.json` file that accompanies the model.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAttributes {
    pub positions: Vec<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_up: Option<Vec<[f32; 3]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_right: Option<Vec<[f32; 3]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Vec<f32>>,
    /// Per-instance properties for the batch table.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Vec<Value>>,
}

impl InstanceAttributes {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn batch_table(&self) -> Result<Option<BatchTable>> {
        if self.properties.is_empty() {
            return Ok(None);
        }
        let mut table = BatchTable::new();
        for (name, values) in &self.properties {
            if values.len() != self.len() {
                return Err(Error::Malformed(format!(
                    "instance property {} has {} values for {} instances",
                    name,
                    values.len(),
                    self.len()
                )));
            }
            table.insert_column(name, values.clone())?;
        }
        Ok(Some(table))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct B3dmFeatureTable {
    batch_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtc_center: Option<[f64; 3]>,
}

/// Reference to a property in the feature table binary.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BinaryBodyReference {
    byte_offset: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct I3dmFeatureTable {
    instances_length: usize,
    position: BinaryBodyReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    normal_up: Option<BinaryBodyReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    normal_right: Option<BinaryBodyReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scale: Option<BinaryBodyReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_length: Option<usize>,
}

/// Appends the vectors as little-endian floats and returns the offset they start at.
fn append_vec3(binary: &mut Vec<u8>, values: &[[f32; 3]]) -> BinaryBodyReference {
    let byte_offset = binary.len();
    for value in values {
        for component in value {
            binary.extend_from_slice(&component.to_le_bytes());
        }
    }
    BinaryBodyReference { byte_offset }
}

/// A `b3dm` or `i3dm` tile, before serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContainer {
    kind: ContainerKind,
    feature_table_json: Vec<u8>,
    feature_table_binary: Vec<u8>,
    batch_table_json: Vec<u8>,
    batch_table_binary: Vec<u8>,
    payload: Payload,
}

impl TileContainer {
    /// Batched 3D Model of a binary glTF. The batch length is the number of features
    /// in the batch table, zero without one.
    pub fn batched(
        glb: Vec<u8>,
        batch_table: Option<&BatchTable>,
        rtc_center: Option<[f64; 3]>,
    ) -> Result<Self> {
        let feature_table = B3dmFeatureTable {
            batch_length: batch_table.map(BatchTable::len).unwrap_or(0),
            rtc_center,
        };
        Ok(Self {
            kind: ContainerKind::Batched,
            feature_table_json: serde_json::to_vec(&feature_table)?,
            feature_table_binary: Vec::new(),
            batch_table_json: Self::batch_table_json(batch_table)?,
            batch_table_binary: Vec::new(),
            payload: Payload::Binary(glb),
        })
    }

    /// Instanced 3D Model. The instance attributes go to the feature table binary.
    pub fn instanced(
        payload: Payload,
        instances: &InstanceAttributes,
        batch_table: Option<&BatchTable>,
    ) -> Result<Self> {
        let count = instances.len();
        let check = |name: &str, length: Option<usize>| match length {
            Some(l) if l != count => Err(Error::Malformed(format!(
                "{} has {} values for {} instances",
                name, l, count
            ))),
            _ => Ok(()),
        };
        check("NORMAL_UP", instances.normal_up.as_ref().map(Vec::len))?;
        check("NORMAL_RIGHT", instances.normal_right.as_ref().map(Vec::len))?;
        check("SCALE", instances.scale.as_ref().map(Vec::len))?;
        check("batch table", batch_table.map(BatchTable::len))?;
        if instances.normal_up.is_some() != instances.normal_right.is_some() {
            return Err(Error::Malformed(
                "NORMAL_UP and NORMAL_RIGHT must be given together".to_string(),
            ));
        }

        let mut binary = Vec::with_capacity(count * 40);
        let position = append_vec3(&mut binary, &instances.positions);
        let normal_up = instances
            .normal_up
            .as_deref()
            .map(|n| append_vec3(&mut binary, n));
        let normal_right = instances
            .normal_right
            .as_deref()
            .map(|n| append_vec3(&mut binary, n));
        let scale = instances.scale.as_ref().map(|scale| {
            let byte_offset = binary.len();
            for s in scale {
                binary.extend_from_slice(&s.to_le_bytes());
            }
            BinaryBodyReference { byte_offset }
        });
        let feature_table = I3dmFeatureTable {
            instances_length: count,
            position,
            normal_up,
            normal_right,
            scale,
            batch_length: batch_table.map(BatchTable::len),
        };
        Ok(Self {
            kind: ContainerKind::Instanced,
            feature_table_json: serde_json::to_vec(&feature_table)?,
            feature_table_binary: binary,
            batch_table_json: Self::batch_table_json(batch_table)?,
            batch_table_binary: Vec::new(),
            payload,
        })
    }

    fn batch_table_json(batch_table: Option<&BatchTable>) -> Result<Vec<u8>> {
        match batch_table {
            Some(t) if !t.is_empty() => Ok(serde_json::to_vec(t)?),
            _ => Ok(Vec::new()),
        }
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header_length = self.kind.header_length();
        let payload_padding = match self.payload {
            Payload::Binary(_) => BINARY_PADDING,
            Payload::Uri(_) => JSON_PADDING,
        };
        let payload: &[u8] = match &self.payload {
            Payload::Binary(glb) => glb,
            Payload::Uri(uri) => uri.as_bytes(),
        };
        let sections: [(&'static str, &[u8], u8); 5] = [
            ("feature table JSON", self.feature_table_json.as_slice(), JSON_PADDING),
            ("feature table binary", self.feature_table_binary.as_slice(), BINARY_PADDING),
            ("batch table JSON", self.batch_table_json.as_slice(), JSON_PADDING),
            ("batch table binary", self.batch_table_binary.as_slice(), BINARY_PADDING),
            ("glTF", payload, payload_padding),
        ];

        let mut body: Vec<u8> = Vec::new();
        let mut lengths = [0_u32; 5];
        for (i, (field, section, padding)) in sections.into_iter().enumerate() {
            let mut padded = section.to_vec();
            pad_to_8(&mut padded, header_length + body.len(), padding);
            lengths[i] = length_u32(field, padded.len())?;
            body.append(&mut padded);
        }
        let byte_length = length_u32("tile", header_length + body.len())?;
        let tables = TableLengths {
            feature_table_json: lengths[0],
            feature_table_binary: lengths[1],
            batch_table_json: lengths[2],
            batch_table_binary: lengths[3],
        };
        let mut bytes = match self.kind {
            ContainerKind::Batched => bincode::serialize(&B3dmHeader {
                magic: *self.kind.magic(),
                version: VERSION,
                byte_length,
                tables,
            })?,
            ContainerKind::Instanced => bincode::serialize(&I3dmHeader {
                magic: *self.kind.magic(),
                version: VERSION,
                byte_length,
                tables,
                gltf_format: self.payload.gltf_format(),
            })?,
        };
        debug_assert_eq!(bytes.len(), header_length);
        bytes.append(&mut body);
        trace!("Encoded {} of {} bytes", self.kind.extension(), bytes.len());
        Ok(bytes)
    }
}

/// A Composite tile of already encoded inner tiles, which are kept as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Composite {
    tiles: Vec<Vec<u8>>,
}

impl Composite {
    pub fn new(tiles: Vec<Vec<u8>>) -> Self {
        Self { tiles }
    }

    pub fn push(&mut self, tile: Vec<u8>) {
        self.tiles.push(tile);
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// The inner tiles must be 8-byte aligned already, which holds for the output of
    /// [TileContainer::to_bytes] and [Composite::to_bytes].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let inner_length: usize = self.tiles.iter().map(Vec::len).sum();
        if let Some(tile) = self.tiles.iter().find(|t| t.len() % 8 != 0) {
            return Err(Error::Malformed(format!(
                "inner tile of {} bytes is not 8-byte aligned",
                tile.len()
            )));
        }
        let header = CmptHeader {
            magic: *b"cmpt",
            version: VERSION,
            byte_length: length_u32("composite", CMPT_HEADER_LENGTH + inner_length)?,
            tiles_length: length_u32("composite tile count", self.tiles.len())?,
        };
        let mut bytes = bincode::serialize(&header)?;
        bytes.reserve(inner_length);
        for tile in &self.tiles {
            bytes.extend_from_slice(tile);
        }
        Ok(bytes)
    }
}

/// The header of an encoded `b3dm` or `i3dm` tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub kind: ContainerKind,
    pub byte_length: u32,
    pub tables: TableLengths,
    /// `i3dm` only: 0 for a URI, 1 for an embedded glTF.
    pub gltf_format: Option<u32>,
}

impl ContainerHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let magic = bytes
            .get(0..4)
            .ok_or_else(|| Error::Malformed(format!("tile of {} bytes", bytes.len())))?;
        let header = match magic {
            b"b3dm" => {
                let h: B3dmHeader = bincode::deserialize(Self::header_bytes(bytes, B3DM_HEADER_LENGTH)?)?;
                Self::check_version(h.version)?;
                ContainerHeader {
                    kind: ContainerKind::Batched,
                    byte_length: h.byte_length,
                    tables: h.tables,
                    gltf_format: None,
                }
            }
            b"i3dm" => {
                let h: I3dmHeader = bincode::deserialize(Self::header_bytes(bytes, I3DM_HEADER_LENGTH)?)?;
                Self::check_version(h.version)?;
                ContainerHeader {
                    kind: ContainerKind::Instanced,
                    byte_length: h.byte_length,
                    tables: h.tables,
                    gltf_format: Some(h.gltf_format),
                }
            }
            other => {
                return Err(Error::Malformed(format!(
                    "unknown magic {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        if header.byte_length as usize > bytes.len() {
            return Err(Error::Malformed(format!(
                "header declares {} bytes, only {} present",
                header.byte_length,
                bytes.len()
            )));
        }
        if header.payload_start() > header.byte_length as usize {
            return Err(Error::Malformed(format!(
                "tables end at byte {}, after the {} bytes of the tile",
                header.payload_start(),
                header.byte_length
            )));
        }
        Ok(header)
    }

    fn header_bytes(bytes: &[u8], length: usize) -> Result<&[u8]> {
        bytes
            .get(0..length)
            .ok_or_else(|| Error::Malformed(format!("truncated header of {} bytes", bytes.len())))
    }

    fn check_version(version: u32) -> Result<()> {
        if version != VERSION {
            return Err(Error::Malformed(format!("unsupported version {}", version)));
        }
        Ok(())
    }

    pub fn header_length(&self) -> usize {
        self.kind.header_length()
    }

    /// Byte range of the glTF payload within the tile. [Self::parse] checks that the
    /// tables end within the tile.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        self.payload_start()..self.byte_length as usize
    }

    fn payload_start(&self) -> usize {
        let t = &self.tables;
        self.header_length()
            + t.feature_table_json as usize
            + t.feature_table_binary as usize
            + t.batch_table_json as usize
            + t.batch_table_binary as usize
    }
}

/// Splits a Composite tile into its inner tiles, using the `byteLength` of each inner
/// tile header.
pub fn parse_composite(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let header_bytes = bytes
        .get(0..CMPT_HEADER_LENGTH)
        .ok_or_else(|| Error::Malformed(format!("composite of {} bytes", bytes.len())))?;
    let header: CmptHeader = bincode::deserialize(header_bytes)?;
    if &header.magic != b"cmpt" {
        return Err(Error::Malformed("not a composite tile".to_string()));
    }
    if header.byte_length as usize != bytes.len() {
        return Err(Error::Malformed(format!(
            "composite declares {} bytes, got {}",
            header.byte_length,
            bytes.len()
        )));
    }
    let mut tiles = Vec::with_capacity(header.tiles_length as usize);
    let mut offset = CMPT_HEADER_LENGTH;
    for _ in 0..header.tiles_length {
        let length = bytes
            .get(offset + 8..offset + 12)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| Error::Malformed(format!("truncated inner tile at {}", offset)))?
            as usize;
        let tile = bytes
            .get(offset..offset + length)
            .filter(|_| length >= 12)
            .ok_or_else(|| {
                Error::Malformed(format!("inner tile of {} bytes at {}", length, offset))
            })?;
        tiles.push(tile);
        offset += length;
    }
    if offset != bytes.len() {
        return Err(Error::Malformed(format!(
            "{} trailing bytes after the inner tiles",
            bytes.len() - offset
        )));
    }
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A fake binary glTF, the payload is not inspected.
    fn glb(length: usize) -> Vec<u8> {
        let mut b = b"glTF".to_vec();
        b.resize(length, 7);
        b
    }

    #[test]
    fn test_b3dm_layout() {
        let bytes = TileContainer::batched(glb(10), None, None)
            .unwrap()
            .to_bytes()
            .unwrap();
        let header = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(&bytes[0..4], b"b3dm");
        assert_eq!(header.kind, ContainerKind::Batched);
        assert_eq!(header.byte_length as usize, bytes.len());
        assert_eq!(bytes.len() % 8, 0);
        // {"BATCH_LENGTH":0} is 18 bytes, 28 + 18 = 46 is padded to 48.
        assert_eq!(header.tables.feature_table_json, 20);
        let json_end = 28 + header.tables.feature_table_json as usize;
        assert_eq!(json_end % 8, 0);
        assert_eq!(&bytes[28..json_end], b"{\"BATCH_LENGTH\":0}  ");
        assert_eq!(header.tables.feature_table_binary, 0);
        assert_eq!(header.tables.batch_table_json, 0);
        let payload = &bytes[header.payload_range()];
        assert_eq!(&payload[..10], &glb(10)[..]);
        assert!(payload[10..].iter().all(|b| *b == 0));
        assert_eq!(payload.len(), 16);
    }

    #[test]
    fn test_b3dm_with_batch_table_and_rtc() {
        let mut table = BatchTable::new();
        table
            .insert_column("id", vec![json!(1), json!(2), json!(3)])
            .unwrap();
        let bytes = TileContainer::batched(glb(24), Some(&table), Some([1.0, 2.0, 3.0]))
            .unwrap()
            .to_bytes()
            .unwrap();
        let header = ContainerHeader::parse(&bytes).unwrap();
        let start = 28;
        let ft_end = start + header.tables.feature_table_json as usize;
        let ft: Value = serde_json::from_slice(&bytes[start..ft_end]).unwrap();
        assert_eq!(ft, json!({"BATCH_LENGTH": 3, "RTC_CENTER": [1.0, 2.0, 3.0]}));
        let bt_start = ft_end + header.tables.feature_table_binary as usize;
        let bt_end = bt_start + header.tables.batch_table_json as usize;
        assert_eq!(bt_end % 8, 0);
        let bt: Value = serde_json::from_slice(&bytes[bt_start..bt_end]).unwrap();
        assert_eq!(bt, json!({"id": [1, 2, 3]}));
    }

    #[test]
    fn test_batch_table_column_lengths() {
        let mut table = BatchTable::new();
        table.insert_column("a", vec![json!(1)]).unwrap();
        assert!(matches!(
            table.insert_column("b", vec![json!(1), json!(2)]),
            Err(Error::Malformed(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_i3dm_layout() {
        let instances = InstanceAttributes {
            positions: vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            scale: Some(vec![1.0, 2.0]),
            ..Default::default()
        };
        let bytes = TileContainer::instanced(Payload::Binary(glb(8)), &instances, None)
            .unwrap()
            .to_bytes()
            .unwrap();
        let header = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(header.kind, ContainerKind::Instanced);
        assert_eq!(header.gltf_format, Some(1));
        assert_eq!(bytes.len() % 8, 0);
        let ft_end = 32 + header.tables.feature_table_json as usize;
        let ft: Value = serde_json::from_slice(&bytes[32..ft_end]).unwrap();
        assert_eq!(ft["INSTANCES_LENGTH"], json!(2));
        assert_eq!(ft["POSITION"]["byteOffset"], json!(0));
        assert_eq!(ft["SCALE"]["byteOffset"], json!(24));
        assert!(ft.get("NORMAL_UP").is_none());
        // 6 position and 2 scale floats.
        assert_eq!(header.tables.feature_table_binary, 32);
        let second_x = &bytes[ft_end + 12..ft_end + 16];
        assert_eq!(second_x, &4.0_f32.to_le_bytes());
    }

    #[test]
    fn test_i3dm_uri_payload() {
        let instances = InstanceAttributes {
            positions: vec![[0.0; 3]],
            ..Default::default()
        };
        let bytes = TileContainer::instanced(Payload::Uri("tree.glb".into()), &instances, None)
            .unwrap()
            .to_bytes()
            .unwrap();
        let header = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(header.gltf_format, Some(0));
        let payload = &bytes[header.payload_range()];
        assert_eq!(payload, b"tree.glb");
    }

    #[test]
    fn test_i3dm_rejects_mismatched_attributes() {
        let instances = InstanceAttributes {
            positions: vec![[0.0; 3], [1.0; 3]],
            normal_up: Some(vec![[0.0, 0.0, 1.0], [0.0, 0.0, 1.0]]),
            ..Default::default()
        };
        assert!(matches!(
            TileContainer::instanced(Payload::Binary(glb(8)), &instances, None),
            Err(Error::Malformed(_))
        ));
        let instances = InstanceAttributes {
            positions: vec![[0.0; 3], [1.0; 3]],
            scale: Some(vec![1.0]),
            ..Default::default()
        };
        assert!(TileContainer::instanced(Payload::Binary(glb(8)), &instances, None).is_err());
    }

    #[test]
    fn test_instances_from_json() {
        let instances: InstanceAttributes = serde_json::from_value(json!({
            "positions": [[0.0, 0.0, 0.0]],
            "properties": {"name": ["oak"]}
        }))
        .unwrap();
        let table = instances.batch_table().unwrap().unwrap();
        assert_eq!(table.len(), 1);
        let bytes = TileContainer::instanced(Payload::Binary(glb(8)), &instances, Some(&table))
            .unwrap()
            .to_bytes()
            .unwrap();
        let header = ContainerHeader::parse(&bytes).unwrap();
        assert!(header.tables.batch_table_json > 0);
    }

    #[test]
    fn test_composite_roundtrip() {
        let b3dm = TileContainer::batched(glb(10), None, None)
            .unwrap()
            .to_bytes()
            .unwrap();
        let instances = InstanceAttributes {
            positions: vec![[0.0; 3]],
            ..Default::default()
        };
        let i3dm = TileContainer::instanced(Payload::Binary(glb(30)), &instances, None)
            .unwrap()
            .to_bytes()
            .unwrap();
        let cmpt = Composite::new(vec![b3dm.clone(), i3dm.clone()])
            .to_bytes()
            .unwrap();
        assert_eq!(&cmpt[0..4], b"cmpt");
        assert_eq!(cmpt.len(), 16 + b3dm.len() + i3dm.len());
        assert_eq!(cmpt.len() % 8, 0);
        let inner = parse_composite(&cmpt).unwrap();
        assert_eq!(inner, vec![&b3dm[..], &i3dm[..]]);

        // A composite can be nested in another one.
        let outer = Composite::new(vec![cmpt.clone()]).to_bytes().unwrap();
        assert_eq!(parse_composite(&outer).unwrap(), vec![&cmpt[..]]);
    }

    #[test]
    fn test_composite_rejects_bad_input() {
        assert!(Composite::new(vec![vec![0; 12]]).to_bytes().is_err());
        let cmpt = Composite::new(vec![]).to_bytes().unwrap();
        assert_eq!(cmpt.len(), 16);
        assert!(parse_composite(&cmpt).unwrap().is_empty());
        assert!(parse_composite(&cmpt[..10]).is_err());
        let mut truncated = Composite::new(vec![TileContainer::batched(glb(4), None, None)
            .unwrap()
            .to_bytes()
            .unwrap()])
        .to_bytes()
        .unwrap();
        truncated.truncate(40);
        assert!(parse_composite(&truncated).is_err());
    }

    #[test]
    fn test_parse_header_errors() {
        assert!(ContainerHeader::parse(b"b3d").is_err());
        assert!(ContainerHeader::parse(b"abcdefgh").is_err());
        assert!(ContainerHeader::parse(&[b'b', b'3', b'd', b'm', 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_tables() {
        let tables = TableLengths {
            feature_table_json: u32::MAX,
            feature_table_binary: u32::MAX,
            batch_table_json: u32::MAX,
            batch_table_binary: 8,
        };
        let header = B3dmHeader {
            magic: *b"b3dm",
            version: VERSION,
            byte_length: B3DM_HEADER_LENGTH as u32,
            tables,
        };
        let bytes = bincode::serialize(&header).unwrap();
        assert_eq!(bytes.len(), B3DM_HEADER_LENGTH);
        assert!(matches!(ContainerHeader::parse(&bytes), Err(Error::Malformed(_))));

        let header = ContainerHeader {
            kind: ContainerKind::Batched,
            byte_length: u32::MAX,
            tables,
            gltf_format: None,
        };
        let range = header.payload_range();
        assert_eq!(range.start, B3DM_HEADER_LENGTH + 3 * u32::MAX as usize + 8);
        assert_eq!(range.end, u32::MAX as usize);
    }
}
