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
//! Error types.
//!
//! Three families of failures exist. Configuration errors abort the run before
//! anything is written. Invalid tiles are skipped and reported while the geocell
//! keeps processing. Write failures are fatal for the geocell that hit them.
use std::path::PathBuf;

use thiserror::Error;

use crate::address::TileAddress;
use crate::collection::GroupName;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid tile: {0}")]
    InvalidTile(#[from] InvalidTile),
    #[error("the {field} of {length} bytes does not fit in a 32-bit length field")]
    LengthOverflow { field: &'static str, length: usize },
    #[error("malformed container: {0}")]
    Malformed(String),
    #[error("could not write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("subtree levels must be within [1, 16], got {0}")]
    SubtreeLevels(u32),
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("maximum level must be within [-10, 23], got {0}")]
    MaxLevel(i32),
    #[error("dataset groups {0} and {1} use different refinement and cannot share a manifest")]
    ConflictingRefinement(GroupName, GroupName),
    #[error("multi-content manifests require implicit tiling (--3dtiles-next)")]
    MultiContentWithoutImplicit,
    #[error("output path {0:?} is not writable: {1}")]
    OutputNotWritable(PathBuf, String),
}

/// A tile that is rejected at insertion. The offending tile is skipped.
#[derive(Error, Debug, PartialEq)]
pub enum InvalidTile {
    #[error("level {level} of {address} is outside [-10, 23]")]
    Level { address: String, level: i32 },
    #[error("coordinate ({x}, {y}) of {address} is outside the grid of level {level}")]
    Coordinate {
        address: String,
        level: i32,
        x: u32,
        y: u32,
    },
    #[error("component selectors ({cs1}, {cs2}) of {address} are outside [0, 999]")]
    ComponentSelector { address: String, cs1: u32, cs2: u32 },
    #[error("tile {0} has no resolvable content reference")]
    UnresolvedContent(String),
    #[error("content of {address} must be named {expected} for implicit tiling, got {found}")]
    ContentName {
        address: String,
        expected: String,
        found: String,
    },
    #[error("dataset {dataset} of {address} belongs to no dataset group")]
    NoGroup { address: String, dataset: String },
    #[error("could not parse a tile address from {0:?}")]
    Unparsable(String),
}

impl InvalidTile {
    pub(crate) fn coordinate(address: &TileAddress) -> Self {
        Self::Coordinate {
            address: address.to_string(),
            level: address.level,
            x: address.x,
            y: address.y,
        }
    }
}
