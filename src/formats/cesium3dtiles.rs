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
//! Cesium [3D Tiles](https://github.com/CesiumGS/3d-tiles).
//! Supported version: 1.1, with the `3DTILES_implicit_tiling` and
//! `3DTILES_multiple_contents` extensions.
//! Not supported: `extras`.
use std::collections::HashMap;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::formats::write_atomically;
use crate::spatial_structs::BoundingRegion;

/// [Tileset](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tileset).
///
/// Not supported: `extras`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Tileset {
    asset: Asset,
    geometric_error: GeometricError,
    root: Tile,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Properties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions_used: Option<Vec<ExtensionName>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions_required: Option<Vec<ExtensionName>>,
}

impl Tileset {
    /// Tileset over the tile tree of `root`. The geometric error of the tileset is
    /// larger than the root's, so that the root is always loaded first. The
    /// extensions of the tiles are listed as used and required.
    pub fn new(root: Tile) -> Self {
        let geometric_error = root.geometric_error * 1.5;
        let mut extensions_used = Vec::new();
        root.collect_extension_names(&mut extensions_used);
        let extensions_used = if extensions_used.is_empty() {
            None
        } else {
            Some(extensions_used)
        };
        Self {
            asset: Default::default(),
            geometric_error,
            root,
            properties: None,
            extensions_required: extensions_used.clone(),
            extensions_used,
        }
    }

    /// Tileset with an implicit quadtree at the root, see [Tile::implicit].
    pub fn implicit(
        region: &BoundingRegion,
        geometric_error: f64,
        refine: Refinement,
        tiling: ImplicitTiling,
        content_templates: Vec<String>,
    ) -> Self {
        Self::new(Tile::implicit(
            region,
            geometric_error,
            refine,
            tiling,
            content_templates,
        ))
    }

    /// Height range of the content, as the tileset `properties`.
    pub fn with_height_properties(mut self, min_height: f64, max_height: f64) -> Self {
        let mut properties: Properties = HashMap::new();
        properties.insert(
            "Height".to_string(),
            PropertyRange {
                minimum: min_height,
                maximum: max_height,
            },
        );
        self.properties = Some(properties);
        self
    }

    pub fn root(&self) -> &Tile {
        &self.root
    }

    pub fn geometric_error(&self) -> f64 {
        self.geometric_error
    }

    /// Write the tileset to a `tileset.json` file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        write_atomically(path.as_ref(), &json)?;
        debug!("Wrote tileset {:?}", path.as_ref());
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// [Asset](https://github.com/CesiumGS/3d-tiles/tree/main/specification#asset).
///
/// Not supported: `extensions, extras`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Asset {
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tileset_version: Option<String>,
}

impl Default for Asset {
    fn default() -> Self {
        Self {
            version: String::from("1.1"),
            tileset_version: None,
        }
    }
}

/// [geometricError](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tilesetgeometricerror-white_check_mark).
/// Must be `>=0`.
type GeometricError = f64;

/// [Properties](https://github.com/CesiumGS/3d-tiles/tree/main/specification#properties).
type Properties = HashMap<String, PropertyRange>;

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct PropertyRange {
    maximum: f64,
    minimum: f64,
}

type Extensions = HashMap<ExtensionName, Extension>;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
enum Extension {
    /// [3DTILES_implicit_tiling](https://github.com/CesiumGS/3d-tiles/tree/main/extensions/3DTILES_implicit_tiling).
    ImplicitTiling(ImplicitTiling),
    /// [3DTILES_multiple_contents](https://github.com/CesiumGS/3d-tiles/tree/main/extensions/3DTILES_multiple_contents).
    MultipleContents { content: Vec<Content> },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionName {
    #[serde(rename = "3DTILES_implicit_tiling")]
    ImplicitTiling,
    #[serde(rename = "3DTILES_multiple_contents")]
    MultipleContents,
}

/// The implicit quadtree of a tile.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImplicitTiling {
    subdivision_scheme: SubdivisionScheme,
    subtree_levels: u16,
    /// Level of the deepest available tile, relative to the root.
    maximum_level: u16,
    subtrees: Subtrees,
}

impl ImplicitTiling {
    pub fn quadtree(subtree_levels: u16, maximum_level: u16, subtrees_template: String) -> Self {
        Self {
            subdivision_scheme: SubdivisionScheme::Quadtree,
            subtree_levels,
            maximum_level,
            subtrees: Subtrees {
                uri: subtrees_template,
            },
        }
    }

    pub fn maximum_level(&self) -> u16 {
        self.maximum_level
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
enum SubdivisionScheme {
    Quadtree,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Subtrees {
    uri: String,
}

/// [Tile](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tile).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    bounding_volume: BoundingVolume,
    geometric_error: GeometricError,
    #[serde(skip_serializing_if = "Option::is_none")]
    refine: Option<Refinement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<Vec<Tile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions: Option<Extensions>,
}

impl Tile {
    /// The root of an implicit quadtree. The tiles and the subtrees are found with
    /// the URI templates, where `{level}`, `{x}` and `{y}` are the quadtree node. The
    /// quadtree subdivides `region`.
    ///
    /// With more than one content template, the tile uses `3DTILES_multiple_contents`.
    pub fn implicit(
        region: &BoundingRegion,
        geometric_error: f64,
        refine: Refinement,
        tiling: ImplicitTiling,
        content_templates: Vec<String>,
    ) -> Self {
        let mut tile = Self::new(region, geometric_error, refine, None, Vec::new())
            .with_content_uris(content_templates);
        tile.extensions
            .get_or_insert_with(HashMap::new)
            .insert(ExtensionName::ImplicitTiling, Extension::ImplicitTiling(tiling));
        tile
    }

    /// Replaces the content of the tile. One URI is the tile content, several are
    /// written with `3DTILES_multiple_contents`.
    pub fn with_content_uris(mut self, uris: Vec<String>) -> Self {
        if let Some(extensions) = self.extensions.as_mut() {
            extensions.remove(&ExtensionName::MultipleContents);
        }
        if uris.len() > 1 {
            self.content = None;
            self.extensions.get_or_insert_with(HashMap::new).insert(
                ExtensionName::MultipleContents,
                Extension::MultipleContents {
                    content: uris.into_iter().map(Content::new).collect(),
                },
            );
        } else {
            self.content = uris.into_iter().next().map(Content::new);
        }
        self
    }

    fn collect_extension_names(&self, names: &mut Vec<ExtensionName>) {
        if let Some(extensions) = &self.extensions {
            for name in [ExtensionName::ImplicitTiling, ExtensionName::MultipleContents] {
                if extensions.contains_key(&name) && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        for child in self.children() {
            child.collect_extension_names(names);
        }
    }

    /// An explicit tile. Empty `children` are left out of the JSON.
    pub fn new(
        region: &BoundingRegion,
        geometric_error: f64,
        refine: Refinement,
        content_uri: Option<String>,
        children: Vec<Tile>,
    ) -> Self {
        Self {
            bounding_volume: BoundingVolume::from(region),
            geometric_error,
            refine: Some(refine),
            content: content_uri.map(Content::new),
            children: if children.is_empty() {
                None
            } else {
                Some(children)
            },
            extensions: None,
        }
    }

    pub fn region(&self) -> BoundingRegion {
        let BoundingVolume::Region(r) = self.bounding_volume;
        BoundingRegion::new(r[0], r[1], r[2], r[3], r[4], r[5])
    }

    pub fn geometric_error(&self) -> f64 {
        self.geometric_error
    }

    pub fn refine(&self) -> Option<Refinement> {
        self.refine
    }

    pub fn content_uri(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.uri.as_str())
    }

    pub fn children(&self) -> &[Tile] {
        self.children.as_deref().unwrap_or_default()
    }

    pub fn implicit_tiling(&self) -> Option<&ImplicitTiling> {
        match self.extensions.as_ref()?.get(&ExtensionName::ImplicitTiling)? {
            Extension::ImplicitTiling(tiling) => Some(tiling),
            _ => None,
        }
    }

    /// The content URIs of `3DTILES_multiple_contents`.
    pub fn multiple_content_uris(&self) -> Vec<&str> {
        match self
            .extensions
            .as_ref()
            .and_then(|e| e.get(&ExtensionName::MultipleContents))
        {
            Some(Extension::MultipleContents { content }) => {
                content.iter().map(|c| c.uri.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// [boundingVolume](https://github.com/CesiumGS/3d-tiles/tree/main/specification#bounding-volume).
/// Only regions are written, the tiles are addressed in geographic coordinates.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
#[serde(rename_all = "lowercase")]
enum BoundingVolume {
    Region([f64; 6]),
}

impl From<&BoundingRegion> for BoundingVolume {
    fn from(region: &BoundingRegion) -> Self {
        Self::Region(region.to_array())
    }
}

/// [Tile.refine](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tilerefine).
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Refinement {
    Add,
    Replace,
}

/// [Tile.content](https://github.com/CesiumGS/3d-tiles/tree/main/specification#content).
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    bounding_volume: Option<BoundingVolume>,
    uri: String,
}

impl Content {
    fn new(uri: String) -> Self {
        Self {
            bounding_volume: None,
            uri,
        }
    }
}
