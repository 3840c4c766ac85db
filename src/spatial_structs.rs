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
//! Spatial data structures shared by the availability engine and the manifest writers.
use std::fmt::{Display, Formatter};

/// A node of the implicit quadtree.
///
/// Level 0 is the root of the tree. A node at `level` has valid coordinates in
/// `[0, 2^level)` along both axes.
/// We don't expect that the quadtree has more than 65535 levels (u16).
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct QuadTreeNodeId {
    pub level: u16,
    pub x: u32,
    pub y: u32,
}

impl QuadTreeNodeId {
    pub fn new(x: u32, y: u32, level: u16) -> Self {
        Self { level, x, y }
    }

    pub fn root() -> Self {
        Self::new(0, 0, 0)
    }

    /// `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            None
        } else {
            Some(Self::new(self.x >> 1, self.y >> 1, self.level - 1))
        }
    }

    /// The four children in Morton order.
    pub fn children(&self) -> [Self; 4] {
        let (x, y, level) = (self.x << 1, self.y << 1, self.level + 1);
        [
            Self::new(x, y, level),
            Self::new(x + 1, y, level),
            Self::new(x, y + 1, level),
            Self::new(x + 1, y + 1, level),
        ]
    }

    /// The ancestor of this node at `level`, which must not be deeper than the node.
    pub fn ancestor_at(&self, level: u16) -> Self {
        debug_assert!(level <= self.level);
        let shift = self.level - level;
        Self::new(self.x >> shift, self.y >> shift, level)
    }
}

impl Display for QuadTreeNodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.x, self.y)
    }
}

/// 64-bit mask
fn part1by1_64(number: &u64) -> u64 {
    let mut n = *number;
    n &= 0x00000000ffffffff;
    n = (n | (n << 16)) & 0x0000FFFF0000FFFF;
    n = (n | (n << 8)) & 0x00FF00FF00FF00FF;
    n = (n | (n << 4)) & 0x0F0F0F0F0F0F0F0F;
    n = (n | (n << 2)) & 0x3333333333333333;
    n = (n | (n << 1)) & 0x5555555555555555;
    n
}

/// Computing Morton-code from 64bit integers. `x` goes into the even bits, `y` into the
/// odd bits, which is the ordering of the implicit tiling bitstreams.
///
/// Reference: https://github.com/trevorprater/pymorton
pub fn interleave(x: &u64, y: &u64) -> u64 {
    part1by1_64(x) | (part1by1_64(y) << 1)
}

fn unpart1by1_64(mortoncode: &u64) -> u64 {
    let mut n = *mortoncode;
    n &= 0x5555555555555555;
    n = (n ^ (n >> 1)) & 0x3333333333333333;
    n = (n ^ (n >> 2)) & 0x0f0f0f0f0f0f0f0f;
    n = (n ^ (n >> 4)) & 0x00ff00ff00ff00ff;
    n = (n ^ (n >> 8)) & 0x0000ffff0000ffff;
    n = (n ^ (n >> 16)) & 0x00000000ffffffff;
    n
}

/// Computing `[x, y]` from a Morton-code.
///
/// Reference: https://github.com/trevorprater/pymorton
pub fn deinterleave(mortoncode: &u64) -> [u64; 2] {
    [
        unpart1by1_64(mortoncode),
        unpart1by1_64(&(*mortoncode >> 1)),
    ]
}

/// Geographic bounding region.
///
/// Longitudes and latitudes are in radians, heights in meters above the WGS84
/// ellipsoid, the same as a 3D Tiles `boundingVolume.region`.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct BoundingRegion {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub min_height: f64,
    pub max_height: f64,
}

impl BoundingRegion {
    pub fn new(
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        min_height: f64,
        max_height: f64,
    ) -> Self {
        Self {
            west,
            south,
            east,
            north,
            min_height,
            max_height,
        }
    }

    /// Component-wise min/max of both regions.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
            min_height: self.min_height.min(other.min_height),
            max_height: self.max_height.max(other.max_height),
        }
    }

    /// The union of all regions, `None` when there are none.
    pub fn union_all<'r>(regions: impl IntoIterator<Item = &'r Self>) -> Option<Self> {
        regions
            .into_iter()
            .fold(None, |acc: Option<Self>, r| match acc {
                Some(a) => Some(a.union(r)),
                None => Some(*r),
            })
    }

    pub fn to_array(&self) -> [f64; 6] {
        [
            self.west,
            self.south,
            self.east,
            self.north,
            self.min_height,
            self.max_height,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_morton_encode() {
        let mut cells_rowwise: Vec<(u64, u64)> = Vec::new();
        for x in 0..4_u64 {
            for y in 0..4u64 {
                cells_rowwise.push((x, y));
            }
        }
        let mut mortoncodes: Vec<u64> = cells_rowwise
            .iter()
            .map(|cell| interleave(&cell.0, &cell.1))
            .collect();
        mortoncodes.sort();
        let cells_morton: Vec<[u64; 2]> = mortoncodes.iter().map(deinterleave).collect();

        let expected: Vec<[u64; 2]> = vec![
            [0, 0],
            [1, 0],
            [0, 1],
            [1, 1],
            [2, 0],
            [3, 0],
            [2, 1],
            [3, 1],
            [0, 2],
            [1, 2],
            [0, 3],
            [1, 3],
            [2, 2],
            [3, 2],
            [2, 3],
            [3, 3],
        ];

        assert_eq!(cells_morton, expected)
    }

    #[test]
    fn test_node_parent_children() {
        let node = QuadTreeNodeId::new(3, 1, 2);
        assert_eq!(node.parent(), Some(QuadTreeNodeId::new(1, 0, 1)));
        assert_eq!(QuadTreeNodeId::root().parent(), None);
        for child in node.children() {
            assert_eq!(child.parent(), Some(node));
        }
        assert_eq!(node.children()[1], QuadTreeNodeId::new(7, 2, 3));
        assert_eq!(
            QuadTreeNodeId::new(13, 6, 4).ancestor_at(1),
            QuadTreeNodeId::new(1, 0, 1)
        );
        assert_eq!(node.to_string(), "2/3/1");
    }

    #[test]
    fn test_region_union() {
        let a = BoundingRegion::new(0.0, 0.0, 10.0, 10.0, -5.0, 5.0);
        let b = BoundingRegion::new(10.0, 10.0, 20.0, 20.0, 0.0, 50.0);
        assert_eq!(
            a.union(&b),
            BoundingRegion::new(0.0, 0.0, 20.0, 20.0, -5.0, 50.0)
        );
        assert_eq!(BoundingRegion::union_all(&[a, b]), Some(a.union(&b)));
        assert_eq!(BoundingRegion::union_all(std::iter::empty()), None);
    }
}
