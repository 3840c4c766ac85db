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
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::collection::GroupName;

/// Convert a CDB tile database into Cesium 3D Tiles.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Staging directory of the CDB tiles. Each tile is a binary glTF (.glb), named by
    /// its CDB address, eg. N32W118_D001_S001_T001_L02_U1_R3.glb. Several variants of a
    /// tile are named <address>.<variant>.glb. A <file stem>.instances.json next to a
    /// .glb turns it into an instanced model. The directory and all its
    /// subdirectories are searched recursively.
    #[arg(short, long, value_parser = existing_canonical_path)]
    pub input: PathBuf,
    /// Directory for the output. An existing directory is removed first.
    #[arg(short, long)]
    pub output: PathBuf,
    /// Create implicit tiling (https://docs.ogc.org/cs/22-025r4/22-025r4.html#toc31)
    /// with subtree availability files.
    /// By default, explicit tiling is created.
    #[arg(long = "3dtiles-next")]
    pub cesium3dtiles_next: bool,
    /// Number of levels in one subtree of the implicit tiling.
    #[arg(long, default_value = "7")]
    pub subtree_levels: u32,
    /// The finest CDB level to export. Deeper tiles are left out of the tilesets.
    /// Negative levels are the coarser-than-cell levels of CDB, down to -10.
    #[arg(long, allow_negative_numbers = true)]
    pub max_level: Option<i32>,
    /// Dataset groups to combine into the root tileset.json, eg. 'elevation,gs-feature'.
    /// By default all groups are combined.
    #[arg(long, value_enum, value_delimiter = ',')]
    pub combine: Vec<GroupName>,
    /// Write one tileset per geocell that references the content of all dataset groups
    /// with 3DTILES_multiple_contents. Requires --3dtiles-next.
    #[arg(long)]
    pub multi_content: bool,
    /// Generate normals for the elevation meshes.
    #[arg(long)]
    pub elevation_normal: bool,
    /// Generate the coarser levels of detail of the elevation.
    #[arg(long)]
    pub elevation_lod: bool,
    /// Target error of the elevation mesh decimation, between 0.0 and 1.0.
    #[arg(long, default_value = "0.01")]
    pub elevation_decimate_error: f32,
    /// Fraction of the elevation mesh indices to keep when decimating, between 0.0 and 1.0.
    #[arg(long, default_value = "0.3")]
    pub elevation_threshold_indices: f32,
}

fn existing_canonical_path(s: &str) -> Result<PathBuf, String> {
    if let Ok(c) = Path::new(s).canonicalize() {
        if c.exists() {
            Ok(c)
        } else {
            Err(format!("path {:?} does not exist", &c))
        }
    } else {
        Err(format!("could not resolve the path {:?}", s))
    }
}
