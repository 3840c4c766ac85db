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
//! Subtree availability for [implicit tiling](https://github.com/CesiumGS/3d-tiles/tree/main/specification/ImplicitTiling).
//!
//! The quadtree is cut into subtrees of `subtree_levels` levels. Every subtree has two
//! bitstreams. The node bitstream has one bit per node of the subtree. The child
//! bitstream has one bit per node of the level just below the subtree, which is set
//! when a deeper subtree is rooted at that node.
//! A third bitstream with the layout of the node bitstream keeps the nodes that were
//! recorded themselves, without the ancestors that were set by propagation. This is
//! the content availability.
//!
//! Within a level, the bits are in Morton order. The levels are stored one after the
//! other, so the bit of a node at relative level `L` is offset by the `(4^L - 1) / 3`
//! nodes of the shallower levels. The bitstreams are written to the subtree files as
//! they are, so this layout is the wire format and not an internal choice.
//!
//! The engine is not thread safe. Tiles are fed to it by a single writer, see
//! [crate::queue].
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use bitvec::prelude::*;
use log::debug;

use crate::spatial_structs::{deinterleave, interleave, QuadTreeNodeId};

type Bitstream = BitVec<u8, Lsb0>;

/// Number of nodes in the first `levels` levels of a quadtree.
pub fn node_count(levels: u16) -> usize {
    ((1_usize << (2 * levels as usize)) - 1) / 3
}

/// Byte length of a bitstream of `bits`, padded to 8 bytes as the subtree binary
/// requires.
pub fn padded_byte_length(bits: usize) -> usize {
    let bytes = (bits + 7) / 8;
    (bytes + 7) / 8 * 8
}

/// Flat bit index of a node within a subtree's node bitstream.
pub fn bit_index(relative_level: u16, local_x: u32, local_y: u32) -> usize {
    node_count(relative_level) + interleave(&(local_x as u64), &(local_y as u64)) as usize
}

/// Key of a subtree, which is its root node.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct SubtreeKey(pub QuadTreeNodeId);

impl SubtreeKey {
    /// The node that is stored at `index` of this subtree's node bitstream.
    /// This is the inverse of [bit_index].
    pub fn node_at(&self, index: usize) -> QuadTreeNodeId {
        let mut relative_level: u16 = 0;
        while node_count(relative_level + 1) <= index {
            relative_level += 1;
        }
        let [local_x, local_y] = deinterleave(&((index - node_count(relative_level)) as u64));
        QuadTreeNodeId::new(
            (self.0.x << relative_level) | local_x as u32,
            (self.0.y << relative_level) | local_y as u32,
            self.0.level + relative_level,
        )
    }
}

/// `level_x_y`, which is also the naming of the subtree files.
impl Display for SubtreeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.0.level, self.0.x, self.0.y)
    }
}

#[derive(Debug, Clone)]
struct SubtreeAvailability {
    node_buffer: Bitstream,
    child_buffer: Bitstream,
    content_buffer: Bitstream,
}

/// The bitstreams of a subtree, ready to be written to a subtree file.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedSubtree {
    pub key: SubtreeKey,
    pub node_bytes: Vec<u8>,
    pub child_bytes: Vec<u8>,
    pub content_bytes: Vec<u8>,
    /// Number of available nodes.
    pub node_count: usize,
    /// Number of available child subtrees.
    pub child_count: usize,
    /// Number of nodes with content.
    pub content_count: usize,
}

/// Builds the availability bitstreams of all subtrees of one quadtree.
#[derive(Debug)]
pub struct AvailabilityEngine {
    subtree_levels: u16,
    node_byte_length: usize,
    child_byte_length: usize,
    subtrees: BTreeMap<SubtreeKey, SubtreeAvailability>,
    max_level: Option<u16>,
}

impl AvailabilityEngine {
    /// `subtree_levels` must be at least 1; the configuration guarantees this.
    pub fn new(subtree_levels: u16) -> Self {
        debug_assert!(subtree_levels > 0);
        Self {
            subtree_levels,
            node_byte_length: padded_byte_length(node_count(subtree_levels)),
            child_byte_length: padded_byte_length(1 << (2 * subtree_levels as usize)),
            subtrees: BTreeMap::new(),
            max_level: None,
        }
    }

    pub fn subtree_levels(&self) -> u16 {
        self.subtree_levels
    }

    /// Padded byte length of the node bitstream.
    pub fn node_byte_length(&self) -> usize {
        self.node_byte_length
    }

    /// Padded byte length of the child subtree bitstream.
    pub fn child_byte_length(&self) -> usize {
        self.child_byte_length
    }

    /// Deepest level that was recorded, not counting the levels set by propagation.
    pub fn max_level(&self) -> Option<u16> {
        self.max_level
    }

    pub fn is_empty(&self) -> bool {
        self.subtrees.is_empty()
    }

    pub fn subtree_keys(&self) -> impl Iterator<Item = &SubtreeKey> {
        self.subtrees.keys()
    }

    /// The subtree that contains `node`.
    pub fn subtree_root(&self, node: &QuadTreeNodeId) -> SubtreeKey {
        let root_level = node.level / self.subtree_levels * self.subtree_levels;
        SubtreeKey(node.ancestor_at(root_level))
    }

    fn locate(&self, node: &QuadTreeNodeId) -> (SubtreeKey, usize) {
        let relative_level = node.level % self.subtree_levels;
        let mask = (1_u32 << relative_level) - 1;
        (
            self.subtree_root(node),
            bit_index(relative_level, node.x & mask, node.y & mask),
        )
    }

    fn subtree_mut(&mut self, key: SubtreeKey) -> &mut SubtreeAvailability {
        let (node_bits, child_bits) = (self.node_byte_length * 8, self.child_byte_length * 8);
        self.subtrees.entry(key).or_insert_with(|| {
            debug!("Creating subtree {}", key);
            SubtreeAvailability {
                node_buffer: Bitstream::repeat(false, node_bits),
                child_buffer: Bitstream::repeat(false, child_bits),
                content_buffer: Bitstream::repeat(false, node_bits),
            }
        })
    }

    /// Sets the availability and the content bit of `node`. Returns `false` if the
    /// node was already available.
    pub fn record_tile_available(&mut self, node: &QuadTreeNodeId) -> bool {
        self.max_level = self.max_level.max(Some(node.level));
        let (key, index) = self.locate(node);
        self.subtree_mut(key).content_buffer.set(index, true);
        self.set_node_bit(node)
    }

    fn set_node_bit(&mut self, node: &QuadTreeNodeId) -> bool {
        let (key, index) = self.locate(node);
        let was_set = self.subtree_mut(key).node_buffer.replace(index, true);
        !was_set
    }

    /// Sets the availability of all ancestors of `node`, marking each subtree root on
    /// the way as a child subtree of the subtree above it.
    ///
    /// The walk stops at the first ancestor that is already available, because its
    /// own ancestors were set when it was recorded. This holds only if every call to
    /// [Self::record_tile_available] is directly followed by the propagation of the
    /// same node, which is what [Self::add_availability] does.
    pub fn propagate_ancestors(&mut self, node: &QuadTreeNodeId) {
        let levels = self.subtree_levels;
        let mask = (1_u32 << levels) - 1;
        let mut current = *node;
        while let Some(parent) = current.parent() {
            if current.level % levels == 0 {
                let parent_key = self.subtree_root(&parent);
                let index = interleave(&((current.x & mask) as u64), &((current.y & mask) as u64));
                self.subtree_mut(parent_key)
                    .child_buffer
                    .set(index as usize, true);
            }
            if !self.set_node_bit(&parent) {
                break;
            }
            current = parent;
        }
    }

    /// Records `node` and propagates its availability to its ancestors.
    pub fn add_availability(&mut self, node: &QuadTreeNodeId) {
        self.record_tile_available(node);
        self.propagate_ancestors(node);
    }

    /// `true` if `node` or any of its descendants was recorded.
    pub fn is_available(&self, node: &QuadTreeNodeId) -> bool {
        let (key, index) = self.locate(node);
        self.subtrees
            .get(&key)
            .map(|s| s.node_buffer[index])
            .unwrap_or(false)
    }

    /// `true` if `node` itself was recorded.
    pub fn has_content(&self, node: &QuadTreeNodeId) -> bool {
        let (key, index) = self.locate(node);
        self.subtrees
            .get(&key)
            .map(|s| s.content_buffer[index])
            .unwrap_or(false)
    }

    /// `true` if `node` is the root of a subtree that is marked in the child
    /// bitstream of the subtree above it.
    pub fn has_child_subtree(&self, node: &QuadTreeNodeId) -> bool {
        if node.level == 0 || node.level % self.subtree_levels != 0 {
            return false;
        }
        let mask = (1_u32 << self.subtree_levels) - 1;
        let parent_key = SubtreeKey(node.ancestor_at(node.level - self.subtree_levels));
        let index = interleave(&((node.x & mask) as u64), &((node.y & mask) as u64));
        self.subtrees
            .get(&parent_key)
            .map(|s| s.child_buffer[index as usize])
            .unwrap_or(false)
    }

    /// Removes the subtree and returns its padded bitstreams.
    pub fn finalize(&mut self, key: &SubtreeKey) -> Option<FinalizedSubtree> {
        self.subtrees.remove(key).map(|subtree| FinalizedSubtree {
            key: *key,
            node_count: subtree.node_buffer.count_ones(),
            child_count: subtree.child_buffer.count_ones(),
            content_count: subtree.content_buffer.count_ones(),
            node_bytes: subtree.node_buffer.into_vec(),
            child_bytes: subtree.child_buffer.into_vec(),
            content_bytes: subtree.content_buffer.into_vec(),
        })
    }

    /// Finalizes every subtree, in key order.
    pub fn finalize_all(&mut self) -> Vec<FinalizedSubtree> {
        let keys: Vec<SubtreeKey> = self.subtrees.keys().copied().collect();
        keys.iter().filter_map(|key| self.finalize(key)).collect()
    }

    /// Forgets every node deeper than `max_level`. The subtrees rooted below it are
    /// dropped, and the node, content and child subtree bits of the deeper levels are
    /// cleared in the others. Nodes at `max_level` and above keep their availability.
    pub fn truncate(&mut self, max_level: u16) {
        if self.max_level.map_or(true, |deepest| deepest <= max_level) {
            return;
        }
        let levels = self.subtree_levels;
        self.subtrees.retain(|key, _| key.0.level <= max_level);
        for (key, subtree) in self.subtrees.iter_mut() {
            let first_cleared = max_level + 1 - key.0.level;
            if first_cleared < levels {
                let start = node_count(first_cleared);
                subtree.node_buffer[start..].fill(false);
                subtree.content_buffer[start..].fill(false);
            }
            if key.0.level + levels > max_level {
                subtree.child_buffer.fill(false);
            }
        }
        debug!("Truncated the availability to level {}", max_level);
        self.max_level = Some(max_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn node(level: u16, x: u32, y: u32) -> QuadTreeNodeId {
        QuadTreeNodeId::new(x, y, level)
    }

    #[test]
    fn test_buffer_sizes() {
        let engine = AvailabilityEngine::new(7);
        assert_eq!(node_count(7), 5461);
        assert_eq!((node_count(7) + 7) / 8, 683);
        assert_eq!(engine.node_byte_length(), 688);
        assert_eq!(engine.child_byte_length(), 2048);

        let engine = AvailabilityEngine::new(3);
        assert_eq!(node_count(3), 21);
        assert_eq!(engine.node_byte_length(), 8);
        assert_eq!(engine.child_byte_length(), 8);

        let engine = AvailabilityEngine::new(5);
        assert_eq!(node_count(5), 341);
        assert_eq!(engine.node_byte_length(), 48);
        assert_eq!(engine.child_byte_length(), 128);
    }

    #[test]
    fn test_bit_index() {
        assert_eq!(bit_index(0, 0, 0), 0);
        assert_eq!(bit_index(1, 0, 0), 1);
        assert_eq!(bit_index(1, 1, 0), 2);
        assert_eq!(bit_index(1, 0, 1), 3);
        assert_eq!(bit_index(1, 1, 1), 4);
        assert_eq!(bit_index(2, 3, 1), 5 + 7);
    }

    #[test]
    fn test_morton_bijection_within_level() {
        for level in 0..5_u16 {
            let side = 1_u32 << level;
            let mut seen = HashSet::new();
            for x in 0..side {
                for y in 0..side {
                    let i = bit_index(level, x, y);
                    assert!(i >= node_count(level) && i < node_count(level + 1));
                    assert!(seen.insert(i), "duplicate index {} at level {}", i, level);
                    let key = SubtreeKey(QuadTreeNodeId::root());
                    assert_eq!(key.node_at(i), node(level, x, y));
                }
            }
            assert_eq!(seen.len(), (side * side) as usize);
        }
    }

    #[test]
    fn test_record_sets_ancestors() {
        let mut engine = AvailabilityEngine::new(3);
        engine.add_availability(&node(2, 3, 1));
        let subtree = engine.finalize(&SubtreeKey(QuadTreeNodeId::root())).unwrap();
        let expected: HashSet<usize> =
            [bit_index(2, 3, 1), bit_index(1, 1, 0), bit_index(0, 0, 0)].into();
        let bits = subtree.node_bytes.view_bits::<Lsb0>();
        for i in 0..node_count(3) {
            assert_eq!(bits[i], expected.contains(&i), "bit {}", i);
        }
        assert_eq!(subtree.node_count, 3);
        assert_eq!(subtree.child_count, 0);
        assert_eq!(subtree.content_count, 1);
        let content_bits = subtree.content_bytes.view_bits::<Lsb0>();
        assert!(content_bits[bit_index(2, 3, 1)]);
        assert_eq!(subtree.content_bytes.len(), subtree.node_bytes.len());
        assert!(engine.is_empty());
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut engine = AvailabilityEngine::new(3);
        assert!(engine.record_tile_available(&node(1, 1, 0)));
        assert!(!engine.record_tile_available(&node(1, 1, 0)));
        engine.propagate_ancestors(&node(1, 1, 0));
        engine.add_availability(&node(1, 1, 0));
        let subtree = engine.finalize_all().pop().unwrap();
        assert_eq!(subtree.node_count, 2);
    }

    #[test]
    fn test_propagation_crosses_subtrees() {
        let mut engine = AvailabilityEngine::new(2);
        engine.add_availability(&node(3, 5, 2));

        let child_root = node(2, 2, 1);
        assert_eq!(engine.subtree_root(&node(3, 5, 2)), SubtreeKey(child_root));
        assert!(engine.is_available(&node(3, 5, 2)));
        assert!(engine.is_available(&child_root));
        assert!(engine.is_available(&node(1, 1, 0)));
        assert!(engine.is_available(&QuadTreeNodeId::root()));
        assert!(!engine.is_available(&node(1, 0, 0)));
        assert!(engine.has_content(&node(3, 5, 2)));
        assert!(!engine.has_content(&child_root));
        assert!(engine.has_child_subtree(&child_root));
        assert!(!engine.has_child_subtree(&node(2, 0, 0)));

        let subtrees = engine.finalize_all();
        assert_eq!(subtrees.len(), 2);
        let root = &subtrees[0];
        assert_eq!(root.key, SubtreeKey(QuadTreeNodeId::root()));
        assert_eq!(root.child_count, 1);
        let child_bits = root.child_bytes.view_bits::<Lsb0>();
        assert!(child_bits[6]);
        let child = &subtrees[1];
        assert_eq!(child.key.to_string(), "2_2_1");
        assert_eq!(child.node_count, 2);
    }

    #[test]
    fn test_deep_level_without_intermediate_records() {
        // Levels beyond the deepest recorded tile stay absent.
        let mut engine = AvailabilityEngine::new(7);
        engine.add_availability(&node(10, 0, 0));
        assert_eq!(engine.max_level(), Some(10));
        assert!(engine.is_available(&node(7, 0, 0)));
        assert!(!engine.is_available(&node(11, 0, 0)));
        assert!(engine.has_child_subtree(&node(7, 0, 0)));
    }

    #[test]
    fn test_truncate_clears_deeper_levels() {
        let mut engine = AvailabilityEngine::new(2);
        engine.add_availability(&node(0, 0, 0));
        engine.add_availability(&node(1, 1, 1));
        engine.add_availability(&node(3, 5, 2));
        engine.truncate(0);
        assert_eq!(engine.max_level(), Some(0));
        assert!(engine.is_available(&QuadTreeNodeId::root()));
        assert!(!engine.is_available(&node(1, 1, 1)));
        assert!(!engine.is_available(&node(3, 5, 2)));
        assert!(!engine.has_child_subtree(&node(2, 2, 1)));

        let subtrees = engine.finalize_all();
        assert_eq!(subtrees.len(), 1);
        let root = &subtrees[0];
        assert_eq!(root.node_count, 1);
        assert_eq!(root.content_count, 1);
        assert_eq!(root.child_count, 0);
        let bits = root.node_bytes.view_bits::<Lsb0>();
        assert_eq!(bits.first_one(), Some(0));
        assert_eq!(bits.last_one(), Some(0));
    }

    #[test]
    fn test_truncate_keeps_shallower_subtrees() {
        let mut engine = AvailabilityEngine::new(2);
        engine.add_availability(&node(4, 9, 3));
        engine.truncate(2);
        assert_eq!(engine.max_level(), Some(2));
        // The level 2 ancestor roots a subtree that is kept, its deeper bits are not.
        let kept = node(2, 2, 0);
        assert!(engine.is_available(&kept));
        assert!(engine.has_child_subtree(&kept));
        assert!(!engine.has_content(&kept));
        assert!(!engine.is_available(&node(3, 4, 1)));

        let subtrees = engine.finalize_all();
        assert_eq!(subtrees.len(), 2);
        assert_eq!(subtrees[1].key, SubtreeKey(kept));
        assert_eq!(subtrees[1].node_count, 1);
        assert_eq!(subtrees[1].child_count, 0);
        assert_eq!(subtrees[0].child_count, 1);

        // Truncating below the deepest level is a no-op.
        let mut engine = AvailabilityEngine::new(2);
        engine.add_availability(&node(1, 0, 0));
        engine.truncate(5);
        assert_eq!(engine.max_level(), Some(1));
        assert!(engine.is_available(&node(1, 0, 0)));
    }

    fn is_ancestor_or_self(ancestor: &QuadTreeNodeId, node: &QuadTreeNodeId) -> bool {
        ancestor.level <= node.level && node.ancestor_at(ancestor.level) == *ancestor
    }

    fn arb_node(max_level: u16) -> impl Strategy<Value = QuadTreeNodeId> {
        (0..=max_level).prop_flat_map(|level| {
            let side = 1_u32 << level;
            (0..side, 0..side).prop_map(move |(x, y)| QuadTreeNodeId::new(x, y, level))
        })
    }

    proptest! {
        /// A node is available iff it or a descendant was recorded, whatever the order
        /// and duplicates of the records.
        #[test]
        fn availability_is_ancestor_consistent(
            records in prop::collection::vec(arb_node(6), 1..40),
            queries in prop::collection::vec(arb_node(6), 1..40),
            levels in 1_u16..4,
        ) {
            let mut engine = AvailabilityEngine::new(levels);
            for r in records.iter().chain(records.iter().rev()) {
                engine.add_availability(r);
            }
            for r in &records {
                let mut current = Some(*r);
                while let Some(n) = current {
                    prop_assert!(engine.is_available(&n));
                    current = n.parent();
                }
            }
            for q in queries.iter().chain(records.iter()) {
                let expected = records.iter().any(|r| is_ancestor_or_self(q, r));
                prop_assert_eq!(engine.is_available(q), expected);
                let expected_child = q.level > 0 && q.level % levels == 0 && expected;
                prop_assert_eq!(engine.has_child_subtree(q), expected_child);
            }
        }

        #[test]
        fn bit_index_roundtrips(n in arb_node(10), levels in 1_u16..8) {
            let engine = AvailabilityEngine::new(levels);
            let key = engine.subtree_root(&n);
            let (located_key, index) = engine.locate(&n);
            prop_assert_eq!(key, located_key);
            prop_assert!(index < node_count(levels));
            prop_assert_eq!(key.node_at(index), n);
        }
    }
}
