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
//! Addressing of CDB tiles.
//!
//! A tile is identified by its [GeoCell], [Dataset], the pair of component selectors
//! and its level and grid coordinates within the geocell.
//!
//! CDB levels run from -10 to 23. Negative levels are coarser-than-cell levels of
//! detail, which always cover the whole geocell with a single tile.
//!
//! The quadtree of a collection is rooted at CDB level 0, the tile that covers the
//! geocell. A CDB level `l >= 0` is the quadtree level `l` with the same coordinates,
//! so halving the region of the geocell `l` times gives the region of the tile, which
//! is how implicit tiling subdivides the root. The negative levels are not nodes of
//! the quadtree. They are written as a chain of explicit tiles above its root, from
//! the coarsest level down.
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::InvalidTile;
use crate::spatial_structs::{BoundingRegion, QuadTreeNodeId};

/// The coarsest CDB level of detail.
pub const MIN_LEVEL: i32 = -10;
/// The finest CDB level of detail.
pub const MAX_LEVEL: i32 = 23;
/// Component selectors are written with three digits.
pub const MAX_COMPONENT_SELECTOR: u32 = 999;
/// Mean radius of the earth, for converting angles to ground distance.
const EARTH_RADIUS: f64 = 6_371_008.8;

/// CDB geographic cell, identified by the latitude and longitude of its south-west
/// corner in whole degrees.
///
/// The cell is one degree high. Its width grows with the latitude, following the CDB
/// longitude zones.
#[derive(Copy, Clone, Hash, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct GeoCell {
    pub lat: i32,
    pub lon: i32,
}

impl GeoCell {
    pub fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    /// Width of the cell in degrees of longitude.
    pub fn lon_width(&self) -> i32 {
        match self.lat {
            l if (-50..50).contains(&l) => 1,
            l if (-70..-50).contains(&l) || (50..70).contains(&l) => 2,
            l if (-75..-70).contains(&l) || (70..75).contains(&l) => 3,
            l if (-80..-75).contains(&l) || (75..80).contains(&l) => 4,
            l if (-89..-80).contains(&l) || (80..89).contains(&l) => 6,
            _ => 12,
        }
    }

    /// The cell in radians, with the given height range.
    pub fn bounding_region(&self, min_height: f64, max_height: f64) -> BoundingRegion {
        BoundingRegion::new(
            (self.lon as f64).to_radians(),
            (self.lat as f64).to_radians(),
            ((self.lon + self.lon_width()) as f64).to_radians(),
            ((self.lat + 1) as f64).to_radians(),
            min_height,
            max_height,
        )
    }
}

/// CDB names a geocell as eg. `N32W118`.
impl Display for GeoCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{:02}{}{:03}",
            if self.lat < 0 { 'S' } else { 'N' },
            self.lat.abs(),
            if self.lon < 0 { 'W' } else { 'E' },
            self.lon.abs()
        )
    }
}

impl FromStr for GeoCell {
    type Err = InvalidTile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidTile::Unparsable(s.to_string());
        if s.len() != 7 || !s.is_ascii() {
            return Err(err());
        }
        let lat: i32 = s[1..3].parse().map_err(|_| err())?;
        let lon: i32 = s[4..7].parse().map_err(|_| err())?;
        let lat = match &s[0..1] {
            "N" => lat,
            "S" => -lat,
            _ => return Err(err()),
        };
        let lon = match &s[3..4] {
            "E" => lon,
            "W" => -lon,
            _ => return Err(err()),
        };
        if !(-90..90).contains(&lat) || !(-180..180).contains(&lon) {
            return Err(err());
        }
        Ok(Self { lat, lon })
    }
}

/// The CDB datasets that are converted.
#[derive(Copy, Clone, Hash, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub enum Dataset {
    Elevation,
    GSFeature,
    GTFeature,
    RoadNetwork,
    RailRoadNetwork,
    PowerlineNetwork,
    HydrographyNetwork,
    GSModelGeometry,
    GSModelTexture,
    GTModelGeometry500,
    GTModelTexture,
}

impl Dataset {
    pub const ALL: [Dataset; 11] = [
        Dataset::Elevation,
        Dataset::GSFeature,
        Dataset::GTFeature,
        Dataset::RoadNetwork,
        Dataset::RailRoadNetwork,
        Dataset::PowerlineNetwork,
        Dataset::HydrographyNetwork,
        Dataset::GSModelGeometry,
        Dataset::GSModelTexture,
        Dataset::GTModelGeometry500,
        Dataset::GTModelTexture,
    ];

    /// The CDB dataset code, as in the `D001` part of a file name.
    pub fn code(&self) -> u16 {
        match self {
            Dataset::Elevation => 1,
            Dataset::GSFeature => 100,
            Dataset::GTFeature => 101,
            Dataset::RoadNetwork => 201,
            Dataset::RailRoadNetwork => 202,
            Dataset::PowerlineNetwork => 203,
            Dataset::HydrographyNetwork => 204,
            Dataset::GSModelGeometry => 300,
            Dataset::GSModelTexture => 301,
            Dataset::GTModelGeometry500 => 500,
            Dataset::GTModelTexture => 511,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.code() == code)
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dataset::Elevation => "Elevation",
            Dataset::GSFeature => "GSFeature",
            Dataset::GTFeature => "GTFeature",
            Dataset::RoadNetwork => "RoadNetwork",
            Dataset::RailRoadNetwork => "RailRoadNetwork",
            Dataset::PowerlineNetwork => "PowerlineNetwork",
            Dataset::HydrographyNetwork => "HydrographyNetwork",
            Dataset::GSModelGeometry => "GSModelGeometry",
            Dataset::GSModelTexture => "GSModelTexture",
            Dataset::GTModelGeometry500 => "GTModelGeometry_500",
            Dataset::GTModelTexture => "GTModelTexture",
        };
        write!(f, "{}", name)
    }
}

/// Pair of component selectors. Distinguishes content variants of one dataset that
/// share the same spatial hierarchy.
#[derive(Copy, Clone, Hash, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct CsKey {
    pub cs1: u32,
    pub cs2: u32,
}

impl CsKey {
    pub fn new(cs1: u32, cs2: u32) -> Self {
        Self { cs1, cs2 }
    }

    /// Stable hash of the selector pair, used as the directory name of the variant.
    /// This is the Cantor pairing of the two selectors, so it never collides. It is
    /// computed on `u128`, where the pairing of any two `u32` fits.
    pub fn hash(&self) -> u128 {
        let (a, b) = (self.cs1 as u128, self.cs2 as u128);
        (a + b) * (a + b + 1) / 2 + b
    }
}

impl Display for CsKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.cs1, self.cs2)
    }
}

/// Address of one CDB tile.
///
/// `x` is the CDB `R` (right) coordinate, `y` is the `U` (up) coordinate.
#[derive(Copy, Clone, Hash, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct TileAddress {
    pub geocell: GeoCell,
    pub dataset: Dataset,
    pub cs1: u32,
    pub cs2: u32,
    pub level: i32,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    pub fn new(
        geocell: GeoCell,
        dataset: Dataset,
        cs: CsKey,
        level: i32,
        x: u32,
        y: u32,
    ) -> Self {
        Self {
            geocell,
            dataset,
            cs1: cs.cs1,
            cs2: cs.cs2,
            level,
            x,
            y,
        }
    }

    pub fn cs_key(&self) -> CsKey {
        CsKey::new(self.cs1, self.cs2)
    }

    /// Checks that the level and the coordinates exist in the CDB grid, and that the
    /// component selectors are in the CDB range.
    pub fn validate(&self) -> Result<(), InvalidTile> {
        if self.cs1 > MAX_COMPONENT_SELECTOR || self.cs2 > MAX_COMPONENT_SELECTOR {
            return Err(InvalidTile::ComponentSelector {
                address: self.to_string(),
                cs1: self.cs1,
                cs2: self.cs2,
            });
        }
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&self.level) {
            return Err(InvalidTile::Level {
                address: self.to_string(),
                level: self.level,
            });
        }
        let extent: u64 = 1 << self.level.max(0);
        if self.x as u64 >= extent || self.y as u64 >= extent {
            return Err(InvalidTile::coordinate(self));
        }
        Ok(())
    }

    /// `true` for the levels coarser than the geocell, which are not in the quadtree.
    pub fn is_coarse(&self) -> bool {
        self.level < 0
    }

    /// The node of the quadtree, `None` for the coarse levels. The address must be
    /// valid.
    pub fn node(&self) -> Option<QuadTreeNodeId> {
        u16::try_from(self.level)
            .ok()
            .map(|level| QuadTreeNodeId::new(self.x, self.y, level))
    }

    /// The address that corresponds to a `node` of the quadtree of this address'
    /// geocell, dataset and component selectors.
    pub fn with_node(&self, node: &QuadTreeNodeId) -> Self {
        Self {
            level: node.level as i32,
            x: node.x,
            y: node.y,
            ..*self
        }
    }

    /// The coarse tile of `level` of this address' geocell, dataset and component
    /// selectors.
    pub fn with_coarse_level(&self, level: i32) -> Self {
        Self {
            level,
            x: 0,
            y: 0,
            ..*self
        }
    }

    /// The region that the tile covers. Tiles at level 0 and coarser cover the whole
    /// geocell.
    pub fn bounding_region(&self, min_height: f64, max_height: f64) -> BoundingRegion {
        let cell = self.geocell.bounding_region(min_height, max_height);
        if self.level <= 0 {
            return cell;
        }
        let divisions = (1_u64 << self.level) as f64;
        let dx = (cell.east - cell.west) / divisions;
        let dy = (cell.north - cell.south) / divisions;
        let west = cell.west + self.x as f64 * dx;
        let south = cell.south + self.y as f64 * dy;
        BoundingRegion::new(west, south, west + dx, south + dy, min_height, max_height)
    }

    /// Geometric error to use when the geometry does not provide one.
    /// It is proportional to the tile size, so it halves with every level.
    pub fn default_geometric_error(&self) -> f64 {
        let cell_height = 1.0_f64.to_radians() * EARTH_RADIUS;
        cell_height / 32.0 / 2.0_f64.powi(self.level)
    }

    /// File name of the tile content. Quadtree tiles are named after their node, so
    /// that the implicit tiling URI template `{level}_{x}_{y}` resolves to them. The
    /// coarse tiles are named after their CDB level, eg. `LC03.b3dm`, which the
    /// template never produces.
    pub fn content_file_name(&self, extension: &str) -> String {
        match self.node() {
            Some(node) => format!("{}_{}_{}.{}", node.level, node.x, node.y, extension),
            None => format!("LC{:02}.{}", -self.level, extension),
        }
    }
}

/// The CDB file stem of the tile, eg. `N32W118_D001_S001_T001_L02_U1_R3`.
/// Negative levels are written as `LC` followed by the absolute level.
impl Display for TileAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let level = if self.level < 0 {
            format!("LC{:02}", -self.level)
        } else {
            format!("L{:02}", self.level)
        };
        write!(
            f,
            "{}_D{:03}_S{:03}_T{:03}_{}_U{}_R{}",
            self.geocell,
            self.dataset.code(),
            self.cs1,
            self.cs2,
            level,
            self.y,
            self.x
        )
    }
}

/// Parses a CDB file stem. Anything after the first `.` is ignored, so file names
/// with extensions and variant suffixes can be passed in directly.
impl FromStr for TileAddress {
    type Err = InvalidTile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidTile::Unparsable(s.to_string());
        let stem = s.split('.').next().unwrap_or_default();
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 7 {
            return Err(err());
        }
        let field = |part: &str, prefix: &str| -> Result<u32, InvalidTile> {
            part.strip_prefix(prefix)
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(err)
        };
        let geocell: GeoCell = parts[0].parse().map_err(|_| err())?;
        let dataset = u16::try_from(field(parts[1], "D")?)
            .ok()
            .and_then(Dataset::from_code)
            .ok_or_else(err)?;
        let cs1 = field(parts[2], "S")?;
        let cs2 = field(parts[3], "T")?;
        let level = if parts[4].starts_with("LC") {
            -(field(parts[4], "LC")? as i32)
        } else {
            field(parts[4], "L")? as i32
        };
        let y = field(parts[5], "U")?;
        let x = field(parts[6], "R")?;
        Ok(Self {
            geocell,
            dataset,
            cs1,
            cs2,
            level,
            x,
            y,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(level: i32, x: u32, y: u32) -> TileAddress {
        TileAddress::new(
            GeoCell::new(32, -118),
            Dataset::Elevation,
            CsKey::new(1, 1),
            level,
            x,
            y,
        )
    }

    #[test]
    fn test_geocell_display_parse() {
        let gc = GeoCell::new(32, -118);
        assert_eq!(gc.to_string(), "N32W118");
        assert_eq!("N32W118".parse::<GeoCell>().unwrap(), gc);
        let gc = GeoCell::new(-5, 2);
        assert_eq!(gc.to_string(), "S05E002");
        assert_eq!("S05E002".parse::<GeoCell>().unwrap(), gc);
        assert!("X05E002".parse::<GeoCell>().is_err());
        assert!("N95E002".parse::<GeoCell>().is_err());
    }

    #[test]
    fn test_geocell_zones() {
        assert_eq!(GeoCell::new(0, 0).lon_width(), 1);
        assert_eq!(GeoCell::new(-50, 0).lon_width(), 1);
        assert_eq!(GeoCell::new(-51, 0).lon_width(), 2);
        assert_eq!(GeoCell::new(72, 0).lon_width(), 3);
        assert_eq!(GeoCell::new(89, 0).lon_width(), 12);
    }

    #[test]
    fn test_address_display_parse() {
        let a = address(2, 3, 1);
        assert_eq!(a.to_string(), "N32W118_D001_S001_T001_L02_U1_R3");
        assert_eq!(a.to_string().parse::<TileAddress>().unwrap(), a);
        let a = address(-3, 0, 0);
        assert_eq!(a.to_string(), "N32W118_D001_S001_T001_LC03_U0_R0");
        assert_eq!(
            "N32W118_D001_S001_T001_LC03_U0_R0.tree.glb"
                .parse::<TileAddress>()
                .unwrap(),
            a
        );
        assert!("N32W118_D999_S001_T001_L02_U1_R3"
            .parse::<TileAddress>()
            .is_err());
        assert!("N32W118_D001_S001".parse::<TileAddress>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(address(2, 3, 3).validate().is_ok());
        assert!(address(-10, 0, 0).validate().is_ok());
        assert!(matches!(
            address(2, 4, 0).validate(),
            Err(InvalidTile::Coordinate { .. })
        ));
        assert!(matches!(
            address(-2, 0, 1).validate(),
            Err(InvalidTile::Coordinate { .. })
        ));
        assert!(matches!(
            address(24, 0, 0).validate(),
            Err(InvalidTile::Level { .. })
        ));
        assert!(matches!(
            address(-11, 0, 0).validate(),
            Err(InvalidTile::Level { .. })
        ));
        let a = TileAddress::new(GeoCell::new(32, -118), Dataset::Elevation, CsKey::new(999, 999), 1, 1, 1);
        assert!(a.validate().is_ok());
        let a: TileAddress = "N32W118_D001_S4294967295_T4294967295_L01_U1_R1"
            .parse()
            .unwrap();
        assert!(matches!(
            a.validate(),
            Err(InvalidTile::ComponentSelector { cs1: u32::MAX, cs2: u32::MAX, .. })
        ));
        let a = TileAddress::new(GeoCell::new(32, -118), Dataset::Elevation, CsKey::new(1, 1000), 1, 1, 1);
        assert!(matches!(a.validate(), Err(InvalidTile::ComponentSelector { .. })));
    }

    #[test]
    fn test_level_mapping_roundtrip() {
        for (level, x, y) in [(0, 0, 0), (1, 1, 0), (5, 17, 30), (23, 8_000_000, 3)] {
            let a = address(level, x, y);
            let node = a.node().unwrap();
            assert_eq!(node.level as i32, level);
            assert_eq!(a.with_node(&node), a);
        }
        for level in MIN_LEVEL..0 {
            let a = address(level, 0, 0);
            assert!(a.is_coarse());
            assert_eq!(a.node(), None);
            assert_eq!(address(3, 1, 1).with_coarse_level(level), a);
        }
        // CDB level 0 is the root, its children are the four tiles of CDB level 1.
        let level0 = address(0, 0, 0).node().unwrap();
        assert_eq!(level0, QuadTreeNodeId::root());
        assert_eq!(address(1, 1, 1).node().unwrap().parent(), Some(level0));
    }

    /// Implicit tiling halves the root region at every level. The root is the geocell,
    /// so every node must end up with the region of its CDB tile.
    #[test]
    fn test_root_subdivision_gives_tile_regions() {
        let root = address(0, 0, 0).bounding_region(0.0, 10.0);
        for (level, x, y) in [(0, 0, 0), (1, 1, 0), (2, 3, 1), (4, 9, 14), (10, 1023, 512), (15, 7, 30000)] {
            let a = address(level, x, y);
            let node = a.node().unwrap();
            let divisions = 2.0_f64.powi(node.level as i32);
            let width = (root.east - root.west) / divisions;
            let height = (root.north - root.south) / divisions;
            let expected = BoundingRegion::new(
                root.west + node.x as f64 * width,
                root.south + node.y as f64 * height,
                root.west + (node.x + 1) as f64 * width,
                root.south + (node.y + 1) as f64 * height,
                0.0,
                10.0,
            );
            let region = a.bounding_region(0.0, 10.0);
            for (r, e) in region.to_array().iter().zip(expected.to_array()) {
                assert!((r - e).abs() < 1e-12, "{}: {:?} != {:?}", a, region, expected);
            }
        }
        // A wider geocell subdivides the same way.
        let wide = TileAddress::new(GeoCell::new(72, 10), Dataset::Elevation, CsKey::new(1, 1), 1, 1, 1);
        let region = wide.bounding_region(0.0, 0.0);
        assert!((region.west - 11.5_f64.to_radians()).abs() < 1e-12);
        assert!((region.east - 13.0_f64.to_radians()).abs() < 1e-12);
    }

    #[test]
    fn test_bounding_region() {
        let cell = GeoCell::new(32, -118).bounding_region(0.0, 10.0);
        assert_eq!(address(-5, 0, 0).bounding_region(0.0, 10.0), cell);
        assert_eq!(address(0, 0, 0).bounding_region(0.0, 10.0), cell);
        let r = address(1, 1, 0).bounding_region(0.0, 10.0);
        let mid_lon = (-117.5_f64).to_radians();
        assert!((r.west - mid_lon).abs() < 1e-12);
        assert!((r.east - cell.east).abs() < 1e-12);
        assert!((r.south - cell.south).abs() < 1e-12);
        assert!((r.north - (32.5_f64).to_radians()).abs() < 1e-12);
    }

    #[test]
    fn test_default_geometric_error_decreases() {
        let mut previous = f64::INFINITY;
        for level in MIN_LEVEL..=MAX_LEVEL {
            let e = address(level, 0, 0).default_geometric_error();
            assert!(e < previous);
            previous = e;
        }
    }

    #[test]
    fn test_cs_hash() {
        assert_eq!(CsKey::new(0, 0).hash(), 0);
        assert_eq!(CsKey::new(1, 1).hash(), 4);
        assert_ne!(CsKey::new(1, 2).hash(), CsKey::new(2, 1).hash());
        let max = u32::MAX as u128;
        assert_eq!(CsKey::new(u32::MAX, u32::MAX).hash(), (2 * max) * (2 * max + 1) / 2 + max);
    }

    #[test]
    fn test_content_file_name() {
        assert_eq!(address(2, 3, 1).content_file_name("b3dm"), "2_3_1.b3dm");
        assert_eq!(address(0, 0, 0).content_file_name("cmpt"), "0_0_0.cmpt");
        assert_eq!(address(-3, 0, 0).content_file_name("b3dm"), "LC03.b3dm");
        assert_eq!(address(-10, 0, 0).content_file_name("b3dm"), "LC10.b3dm");
    }
}
