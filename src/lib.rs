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
//! Convert a CDB tile database into Cesium 3D Tiles.
//!
//! The tiles are wrapped in 3D Tiles containers by the [formats::container] codec,
//! pushed through the [queue] and collected per geocell by the
//! [collection::TilesetBuilder], which tracks their [availability] and writes the
//! tilesets.
pub mod address;
pub mod availability;
pub mod cli;
pub mod collection;
pub mod config;
pub mod error;
pub mod formats;
pub mod queue;
pub mod spatial_structs;
