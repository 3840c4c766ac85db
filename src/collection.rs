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
//! Assembling the tiles into tilesets.
//!
//! Every tile goes into a [TilesetCollection], one for each collection kind, geocell
//! and component selector pair. A collection keeps the content of its tiles and the
//! availability of its quadtree. When a geocell is complete, the collections of a
//! dataset group are written as tilesets and dropped from memory. The tilesets of
//! all geocells are then combined into one tileset per group, and the groups into
//! the root tileset.
//!
//! Output layout:
//! ```text
//! <output>/tileset.json                              root, over the groups
//! <output>/<group>.json                              one group over all geocells
//! <output>/<geocell>/tileset.json                    multiple contents only
//! <output>/<geocell>/<collection>/<cs hash>/tileset.json
//! <output>/<geocell>/<collection>/<cs hash>/<level>_<x>_<y>.<ext>
//! <output>/<geocell>/<collection>/<cs hash>/LC<nn>.<ext>              coarse levels
//! <output>/<geocell>/<collection>/<cs hash>/availability/<level>_<x>_<y>.subtree
//! ```
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::address::{CsKey, Dataset, GeoCell, TileAddress, MAX_LEVEL};
use crate::availability::{AvailabilityEngine, FinalizedSubtree, SubtreeKey};
use crate::config::Config;
use crate::error::{ConfigError, InvalidTile, Result};
use crate::formats::cesium3dtiles::{ImplicitTiling, Refinement, Tile, Tileset};
use crate::formats::subtree::{self, Bitstream};
use crate::formats::write_atomically;
use crate::spatial_structs::{BoundingRegion, QuadTreeNodeId};

const TILESET_FILE: &str = "tileset.json";
const SUBTREES_DIR: &str = "availability";
const SUBTREES_TEMPLATE: &str = "availability/{level}_{x}_{y}.subtree";

/// Named set of datasets that share their tilesets and refinement.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, clap::ValueEnum)]
pub enum GroupName {
    Elevation,
    GsFeature,
    GtAndVectors,
}

impl GroupName {
    pub const ALL: [GroupName; 3] = [
        GroupName::Elevation,
        GroupName::GsFeature,
        GroupName::GtAndVectors,
    ];
}

impl Display for GroupName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GroupName::Elevation => "Elevation",
            GroupName::GsFeature => "GSFeature",
            GroupName::GtAndVectors => "GTAndVectors",
        };
        write!(f, "{}", name)
    }
}

/// The tilesets that are written per geocell and component selector pair.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub enum CollectionKind {
    Elevation,
    RoadNetwork,
    RailRoadNetwork,
    PowerlineNetwork,
    HydrographyNetwork,
    GTModels,
    GSModels,
}

impl CollectionKind {
    pub fn of(dataset: Dataset) -> Self {
        match dataset {
            Dataset::Elevation => CollectionKind::Elevation,
            Dataset::RoadNetwork => CollectionKind::RoadNetwork,
            Dataset::RailRoadNetwork => CollectionKind::RailRoadNetwork,
            Dataset::PowerlineNetwork => CollectionKind::PowerlineNetwork,
            Dataset::HydrographyNetwork => CollectionKind::HydrographyNetwork,
            Dataset::GTFeature | Dataset::GTModelGeometry500 | Dataset::GTModelTexture => {
                CollectionKind::GTModels
            }
            Dataset::GSFeature | Dataset::GSModelGeometry | Dataset::GSModelTexture => {
                CollectionKind::GSModels
            }
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            CollectionKind::Elevation => "Elevation",
            CollectionKind::RoadNetwork => "RoadNetwork",
            CollectionKind::RailRoadNetwork => "RailRoadNetwork",
            CollectionKind::PowerlineNetwork => "PowerlineNetwork",
            CollectionKind::HydrographyNetwork => "HydrographyNetwork",
            CollectionKind::GTModels => "GTModels",
            CollectionKind::GSModels => "GSModels",
        }
    }

    /// Extension of the tile content. The models of a tile are gathered in a
    /// composite, everything else is one batched model.
    pub fn content_extension(&self) -> &'static str {
        match self {
            CollectionKind::GTModels | CollectionKind::GSModels => "cmpt",
            _ => "b3dm",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetGroup {
    pub name: GroupName,
    pub datasets: Vec<Dataset>,
    pub refine: Refinement,
}

impl DatasetGroup {
    pub fn new(name: GroupName, datasets: Vec<Dataset>, refine: Refinement) -> Self {
        Self {
            name,
            datasets,
            refine,
        }
    }

    /// The collection kinds of the datasets, in dataset order.
    pub fn collection_kinds(&self) -> Vec<CollectionKind> {
        let mut kinds: Vec<CollectionKind> = Vec::new();
        for kind in self.datasets.iter().map(|d| CollectionKind::of(*d)) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }
}

/// Lookup table of the dataset groups. Built once and not modified afterwards.
#[derive(Debug, Clone)]
pub struct DatasetGroups {
    groups: BTreeMap<GroupName, DatasetGroup>,
    membership: BTreeMap<Dataset, GroupName>,
}

impl DatasetGroups {
    /// A dataset that is listed in more than one group belongs to the last one.
    pub fn new(groups: Vec<DatasetGroup>) -> Self {
        let mut membership = BTreeMap::new();
        for group in &groups {
            for dataset in &group.datasets {
                membership.insert(*dataset, group.name);
            }
        }
        Self {
            groups: groups.into_iter().map(|g| (g.name, g)).collect(),
            membership,
        }
    }

    pub fn get(&self, name: GroupName) -> Option<&DatasetGroup> {
        self.groups.get(&name)
    }

    pub fn group_of(&self, dataset: Dataset) -> Option<&DatasetGroup> {
        self.membership
            .get(&dataset)
            .and_then(|name| self.groups.get(name))
    }

    pub fn group_of_kind(&self, kind: CollectionKind) -> Option<&DatasetGroup> {
        self.groups
            .values()
            .find(|g| g.collection_kinds().contains(&kind))
    }
}

/// The CDB dataset groups.
impl Default for DatasetGroups {
    fn default() -> Self {
        Self::new(vec![
            DatasetGroup::new(
                GroupName::Elevation,
                vec![Dataset::Elevation],
                Refinement::Replace,
            ),
            DatasetGroup::new(
                GroupName::GsFeature,
                vec![
                    Dataset::GSFeature,
                    Dataset::GSModelGeometry,
                    Dataset::GSModelTexture,
                ],
                Refinement::Add,
            ),
            DatasetGroup::new(
                GroupName::GtAndVectors,
                vec![
                    Dataset::GTFeature,
                    Dataset::GTModelGeometry500,
                    Dataset::GTModelTexture,
                    Dataset::RoadNetwork,
                    Dataset::RailRoadNetwork,
                    Dataset::PowerlineNetwork,
                    Dataset::HydrographyNetwork,
                ],
                Refinement::Replace,
            ),
        ])
    }
}

/// The renderable content of a tile, as produced by the model builders.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContent {
    /// Relative to the directory of the collection.
    pub uri: String,
    pub region: Option<BoundingRegion>,
    pub geometric_error: Option<f64>,
}

impl TileContent {
    pub fn new<S: Into<String>>(uri: S) -> Self {
        Self {
            uri: uri.into(),
            region: None,
            geometric_error: None,
        }
    }

    pub fn with_region(mut self, region: BoundingRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_geometric_error(mut self, geometric_error: f64) -> Self {
        self.geometric_error = Some(geometric_error);
        self
    }
}

/// A tileset that was written, and can be referenced from a combined tileset.
#[derive(Debug, Clone, PartialEq)]
pub struct CombineEntry {
    pub path: PathBuf,
    pub region: BoundingRegion,
    pub geometric_error: f64,
}

/// Directory of the collection that the tile belongs to.
pub fn collection_directory(output: &Path, address: &TileAddress) -> PathBuf {
    output
        .join(address.geocell.to_string())
        .join(CollectionKind::of(address.dataset).dir_name())
        .join(address.cs_key().hash().to_string())
}

/// URI of `path` relative to `base`, with forward slashes.
fn relative_uri(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn subtree_file_name(key: &SubtreeKey) -> String {
    format!("{}.subtree", key)
}

fn count_ones(bytes: &[u8]) -> usize {
    bytes.iter().map(|b| b.count_ones() as usize).sum()
}

fn union_heights(a: Option<(f64, f64)>, b: Option<(f64, f64)>) -> Option<(f64, f64)> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a.0.min(b.0), a.1.max(b.1))),
        (a, b) => a.or(b),
    }
}

/// Puts the coarse tiles above `below`, the coarsest at the top. A level may have
/// several contents, each given by its URI. A coarse tile covers the geocell and the
/// tiles below it, and its geometric error is never smaller than theirs.
fn with_coarse_parents(
    below: Option<Tile>,
    coarse: &BTreeMap<i32, Vec<(String, TileContent)>>,
    prototype: &TileAddress,
    heights: Option<(f64, f64)>,
    refine: Refinement,
) -> Option<Tile> {
    let (min_height, max_height) = heights.unwrap_or((0.0, 0.0));
    coarse.iter().rev().fold(below, |child, (level, contents)| {
        let address = prototype.with_coarse_level(*level);
        let cell = address.bounding_region(min_height, max_height);
        let mut regions: Vec<BoundingRegion> =
            contents.iter().map(|(_, c)| c.region.unwrap_or(cell)).collect();
        regions.extend(child.as_ref().map(Tile::region));
        let geometric_error = contents
            .iter()
            .map(|(_, c)| c.geometric_error.unwrap_or_else(|| address.default_geometric_error()))
            .chain(child.as_ref().map(Tile::geometric_error))
            .fold(0.0, f64::max);
        let region = BoundingRegion::union_all(&regions).unwrap_or(cell);
        let uris = contents.iter().map(|(uri, _)| uri.clone()).collect();
        Some(
            Tile::new(&region, geometric_error, refine, None, child.into_iter().collect())
                .with_content_uris(uris),
        )
    })
}

/// The tiles of one collection kind, geocell and component selector pair, with the
/// availability of their quadtree.
///
/// The quadtree is rooted at CDB level 0. The tiles of the coarser levels are kept
/// apart, they become explicit parents of the quadtree root.
#[derive(Debug)]
pub struct TilesetCollection {
    directory: PathBuf,
    kind: CollectionKind,
    /// Any tile of the collection, for deriving the addresses of the other nodes.
    prototype: TileAddress,
    tiles: BTreeMap<QuadTreeNodeId, TileContent>,
    coarse: BTreeMap<i32, TileContent>,
    availability: AvailabilityEngine,
    heights: Option<(f64, f64)>,
}

impl TilesetCollection {
    pub fn new(directory: PathBuf, prototype: TileAddress, subtree_levels: u16) -> Self {
        Self {
            directory,
            kind: CollectionKind::of(prototype.dataset),
            prototype,
            tiles: BTreeMap::new(),
            coarse: BTreeMap::new(),
            availability: AvailabilityEngine::new(subtree_levels),
            heights: None,
        }
    }

    /// The address must be valid and belong to this collection.
    fn insert(&mut self, address: &TileAddress, content: TileContent) {
        if let Some(region) = &content.region {
            self.heights = union_heights(self.heights, Some((region.min_height, region.max_height)));
        }
        let previous = match address.node() {
            Some(node) => {
                self.availability.add_availability(&node);
                self.tiles.insert(node, content)
            }
            None => self.coarse.insert(address.level, content),
        };
        if let Some(previous) = previous {
            warn!("Tile {} was inserted twice, replacing {}", address, previous.uri);
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len() + self.coarse.len()
    }

    /// `true` if the tile or any of its descendants is in the collection. Every finer
    /// tile descends from a coarse tile.
    pub fn is_available(&self, address: &TileAddress) -> bool {
        match address.node() {
            Some(node) => self.availability.is_available(&node),
            None => self.coarse.range(address.level..).next().is_some() || !self.tiles.is_empty(),
        }
    }

    pub fn content(&self, address: &TileAddress) -> Option<&TileContent> {
        match address.node() {
            Some(node) => self.tiles.get(&node),
            None => self.coarse.get(&address.level),
        }
    }

    fn fallback_region(&self, address: &TileAddress) -> BoundingRegion {
        let (min_height, max_height) = self.heights.unwrap_or((0.0, 0.0));
        address.bounding_region(min_height, max_height)
    }

    /// The coarse tiles down to `max_level`, named by their content files.
    fn coarse_contents(&self, max_level: i32) -> BTreeMap<i32, Vec<(String, TileContent)>> {
        self.coarse
            .range(..=max_level)
            .map(|(level, content)| (*level, vec![(content.uri.clone(), content.clone())]))
            .collect()
    }

    /// The shallowest node that has content or more than one available child, so
    /// that the tileset does not start with a chain of empty tiles.
    fn explicit_root_node(&self, max_node_level: u16) -> Option<QuadTreeNodeId> {
        let mut node = QuadTreeNodeId::root();
        if !self.availability.is_available(&node) {
            return None;
        }
        loop {
            if self.tiles.contains_key(&node) || node.level >= max_node_level {
                return Some(node);
            }
            let mut available = node
                .children()
                .into_iter()
                .filter(|c| self.availability.is_available(c));
            match (available.next(), available.next()) {
                (Some(only), None) => node = only,
                _ => return Some(node),
            }
        }
    }

    /// The tile of `node` with its available descendants down to `max_node_level`.
    /// The geometric error never exceeds the error of the parent. The region of a
    /// tile contains the regions of its children.
    fn explicit_tile(
        &self,
        node: QuadTreeNodeId,
        parent_error: f64,
        refine: Refinement,
        max_node_level: u16,
    ) -> Tile {
        let address = self.prototype.with_node(&node);
        let content = self.tiles.get(&node);
        let geometric_error = content
            .and_then(|c| c.geometric_error)
            .unwrap_or_else(|| address.default_geometric_error())
            .min(parent_error);
        let children: Vec<Tile> = if node.level < max_node_level {
            node.children()
                .into_iter()
                .filter(|c| self.availability.is_available(c))
                .map(|c| self.explicit_tile(c, geometric_error, refine, max_node_level))
                .collect()
        } else {
            Vec::new()
        };
        let child_regions: Vec<BoundingRegion> = children.iter().map(Tile::region).collect();
        let own_region = content.map(|c| c.region.unwrap_or_else(|| self.fallback_region(&address)));
        let region = match (own_region, BoundingRegion::union_all(&child_regions)) {
            (Some(own), Some(children)) => own.union(&children),
            (Some(own), None) => own,
            (None, Some(children)) => children,
            (None, None) => self.fallback_region(&address),
        };
        Tile::new(
            &region,
            geometric_error,
            refine,
            content.map(|c| c.uri.clone()),
            children,
        )
    }

    /// The explicit tile tree, without the tiles deeper than the CDB level
    /// `max_level`. The coarse tiles are chained above the quadtree.
    pub fn explicit_tileset(&self, refine: Refinement, max_level: i32) -> Option<Tileset> {
        let quadtree = u16::try_from(max_level).ok().and_then(|max_node_level| {
            let root_node = self.explicit_root_node(max_node_level)?;
            Some(self.explicit_tile(root_node, f64::INFINITY, refine, max_node_level))
        });
        let root = with_coarse_parents(
            quadtree,
            &self.coarse_contents(max_level),
            &self.prototype,
            self.heights,
            refine,
        )?;
        let tileset = Tileset::new(root);
        Some(match self.heights {
            Some((min, max)) => tileset.with_height_properties(min, max),
            None => tileset,
        })
    }

    fn write_explicit(&self, refine: Refinement, max_level: i32) -> Result<Option<CombineEntry>> {
        let Some(tileset) = self.explicit_tileset(refine, max_level) else {
            return Ok(None);
        };
        let path = self.directory.join(TILESET_FILE);
        tileset.to_file(&path)?;
        Ok(Some(CombineEntry {
            path,
            region: tileset.root().region(),
            geometric_error: tileset.geometric_error(),
        }))
    }

    /// Region of the implicit root, which is the whole geocell.
    fn root_region(&self) -> BoundingRegion {
        self.fallback_region(&self.prototype.with_node(&QuadTreeNodeId::root()))
    }

    fn root_geometric_error(&self) -> f64 {
        self.prototype
            .with_node(&QuadTreeNodeId::root())
            .default_geometric_error()
    }

    /// Writes the subtree files and the tileset, with the implicit quadtree below the
    /// coarse tiles. The availability is truncated to the CDB level `max_level` and
    /// consumed.
    fn write_implicit(&mut self, refine: Refinement, max_level: i32) -> Result<Option<CombineEntry>> {
        let quadtree = match (self.availability.max_level(), u16::try_from(max_level)) {
            (Some(deepest), Ok(cap)) => {
                let maximum_level = deepest.min(cap);
                self.availability.truncate(maximum_level);
                let subtree_levels = self.availability.subtree_levels();
                let subtrees_dir = self.directory.join(SUBTREES_DIR);
                for s in self.availability.finalize_all() {
                    let bytes = subtree::to_bytes(
                        Bitstream::new(&s.node_bytes, s.node_count),
                        &[Bitstream::new(&s.content_bytes, s.content_count)],
                        Bitstream::new(&s.child_bytes, s.child_count),
                    )?;
                    write_atomically(subtrees_dir.join(subtree_file_name(&s.key)), &bytes)?;
                }
                Some(Tile::implicit(
                    &self.root_region(),
                    self.root_geometric_error(),
                    refine,
                    ImplicitTiling::quadtree(subtree_levels, maximum_level, SUBTREES_TEMPLATE.to_string()),
                    vec![format!("{{level}}_{{x}}_{{y}}.{}", self.kind.content_extension())],
                ))
            }
            _ => None,
        };
        let Some(root) = with_coarse_parents(
            quadtree,
            &self.coarse_contents(max_level),
            &self.prototype,
            self.heights,
            refine,
        ) else {
            return Ok(None);
        };
        let tileset = Tileset::new(root);
        let path = self.directory.join(TILESET_FILE);
        tileset.to_file(&path)?;
        Ok(Some(CombineEntry {
            path,
            region: tileset.root().region(),
            geometric_error: tileset.geometric_error(),
        }))
    }
}

/// One collection that contributes to a multiple-contents tileset.
struct ContentSource {
    id: String,
    template: String,
    subtrees: BTreeMap<SubtreeKey, FinalizedSubtree>,
    maximum_level: u16,
}

/// Combines tilesets into one, each of them referenced by a child of the root.
/// `None` when there is nothing to combine.
pub fn combine_across_geocells(
    entries: &[CombineEntry],
    base: &Path,
    refine: Refinement,
) -> Option<Tileset> {
    let region = BoundingRegion::union_all(entries.iter().map(|e| &e.region))?;
    let geometric_error = entries
        .iter()
        .map(|e| e.geometric_error)
        .fold(0.0, f64::max);
    let children: Vec<Tile> = entries
        .iter()
        .map(|e| {
            Tile::new(
                &e.region,
                e.geometric_error,
                refine,
                Some(relative_uri(base, &e.path)),
                Vec::new(),
            )
        })
        .collect();
    Some(Tileset::new(Tile::new(
        &region,
        geometric_error,
        refine,
        None,
        children,
    )))
}

/// Writes a combined tileset to `path`. The children are referenced relative to the
/// directory of `path`.
pub fn write_combined_manifest(
    path: &Path,
    entries: &[CombineEntry],
    refine: Refinement,
) -> Result<Option<CombineEntry>> {
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let Some(tileset) = combine_across_geocells(entries, base, refine) else {
        return Ok(None);
    };
    tileset.to_file(path)?;
    Ok(Some(CombineEntry {
        path: path.to_path_buf(),
        region: tileset.root().region(),
        geometric_error: tileset.geometric_error(),
    }))
}

/// Accumulates the tiles of a conversion and writes the tilesets.
///
/// Not thread safe, the tiles of concurrent producers go through a
/// [crate::queue::TileQueue].
#[derive(Debug)]
pub struct TilesetBuilder {
    config: Config,
    output: PathBuf,
    groups: DatasetGroups,
    collections: BTreeMap<CollectionKind, BTreeMap<GeoCell, BTreeMap<CsKey, TilesetCollection>>>,
    observed_max_levels: BTreeMap<GroupName, i32>,
    combine_entries: BTreeMap<GroupName, Vec<CombineEntry>>,
    multi_content_entries: Vec<CombineEntry>,
}

impl TilesetBuilder {
    /// Creates the output directory if needed.
    pub fn new<P: Into<PathBuf>>(config: Config, output: P) -> Result<Self> {
        let output = output.into();
        fs::create_dir_all(&output)
            .map_err(|e| ConfigError::OutputNotWritable(output.clone(), e.to_string()))?;
        Ok(Self {
            config,
            output,
            groups: DatasetGroups::default(),
            collections: BTreeMap::new(),
            observed_max_levels: BTreeMap::new(),
            combine_entries: BTreeMap::new(),
            multi_content_entries: Vec::new(),
        })
    }

    pub fn with_groups(mut self, groups: DatasetGroups) -> Self {
        self.groups = groups;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn groups(&self) -> &DatasetGroups {
        &self.groups
    }

    /// Adds a tile to its collection and records its availability.
    /// An invalid tile is rejected without changing anything.
    pub fn insert_tile(
        &mut self,
        address: TileAddress,
        content: TileContent,
    ) -> std::result::Result<(), InvalidTile> {
        address.validate()?;
        if content.uri.trim().is_empty() {
            return Err(InvalidTile::UnresolvedContent(address.to_string()));
        }
        let group = self
            .groups
            .group_of(address.dataset)
            .map(|g| g.name)
            .ok_or_else(|| InvalidTile::NoGroup {
                address: address.to_string(),
                dataset: address.dataset.to_string(),
            })?;
        let kind = CollectionKind::of(address.dataset);
        if self.config.use_3dtiles_next {
            let expected = address.content_file_name(kind.content_extension());
            if content.uri != expected {
                return Err(InvalidTile::ContentName {
                    address: address.to_string(),
                    expected,
                    found: content.uri,
                });
            }
        }

        let subtree_levels = self.config.subtree_levels;
        let output = &self.output;
        self.collections
            .entry(kind)
            .or_default()
            .entry(address.geocell)
            .or_default()
            .entry(address.cs_key())
            .or_insert_with(|| {
                debug!("New {} collection {} of {}", kind.dir_name(), address.cs_key(), address.geocell);
                TilesetCollection::new(collection_directory(output, &address), address, subtree_levels)
            })
            .insert(&address, content);
        self.observed_max_levels
            .entry(group)
            .and_modify(|level| *level = (*level).max(address.level))
            .or_insert(address.level);
        Ok(())
    }

    /// Geocells that have tiles that are not flushed yet.
    pub fn geocells(&self) -> Vec<GeoCell> {
        let cells: BTreeSet<GeoCell> = self
            .collections
            .values()
            .flat_map(|per_geocell| per_geocell.keys().copied())
            .collect();
        cells.into_iter().collect()
    }

    pub fn collection(
        &self,
        kind: CollectionKind,
        geocell: GeoCell,
        cs: CsKey,
    ) -> Option<&TilesetCollection> {
        self.collections.get(&kind)?.get(&geocell)?.get(&cs)
    }

    /// Deepest CDB level inserted for the group.
    pub fn observed_max_level(&self, group: GroupName) -> Option<i32> {
        self.observed_max_levels.get(&group).copied()
    }

    /// The finest level that is exported for the group, the configured maximum
    /// level if there is one and it is not deeper than the group's tiles.
    pub fn export_max_level(&self, group: GroupName) -> Option<i32> {
        match (self.config.max_level, self.observed_max_level(group)) {
            (Some(configured), Some(observed)) => Some(configured.min(observed)),
            (configured, observed) => configured.or(observed),
        }
    }

    fn export_level_or_finest(&self, group: GroupName) -> i32 {
        self.export_max_level(group).unwrap_or(MAX_LEVEL)
    }

    /// Writes the tilesets of the group in the geocell, one for each component
    /// selector pair, and drops them from memory. Returns the paths of the
    /// tilesets.
    pub fn flush_dataset_group(&mut self, geocell: GeoCell, name: GroupName) -> Result<Vec<PathBuf>> {
        let Some(group) = self.groups.get(name) else {
            return Ok(Vec::new());
        };
        let refine = group.refine;
        let kinds = group.collection_kinds();
        let max_level = self.export_level_or_finest(name);
        let implicit = self.config.use_3dtiles_next;

        let mut written = Vec::new();
        for kind in kinds {
            let Some(per_cs) = self
                .collections
                .get_mut(&kind)
                .and_then(|per_geocell| per_geocell.remove(&geocell))
            else {
                continue;
            };
            for (cs, mut collection) in per_cs {
                let entry = if implicit {
                    collection.write_implicit(refine, max_level)?
                } else {
                    collection.write_explicit(refine, max_level)?
                };
                if let Some(entry) = entry {
                    debug!("Wrote {} {} of {} to {:?}", kind.dir_name(), cs, geocell, entry.path);
                    written.push(entry.path.clone());
                    self.combine_entries.entry(name).or_default().push(entry);
                }
            }
        }
        if !written.is_empty() {
            info!("Flushed {} tilesets of {} in {}", written.len(), name, geocell);
        }
        Ok(written)
    }

    /// Writes one tileset of the geocell that references the content of all its
    /// collections with `3DTILES_multiple_contents`. The availability of the
    /// collections is merged per subtree of the implicit quadtree. The coarse tiles
    /// of one level share an explicit tile above the quadtree root.
    ///
    /// Returns the identifiers of the collections that contribute to each subtree.
    /// Fails before writing anything if the dataset groups in the geocell do not
    /// share the same refinement.
    pub fn flush_multi_content(&mut self, geocell: GeoCell) -> Result<BTreeMap<SubtreeKey, Vec<String>>> {
        if !self.config.use_3dtiles_next {
            return Err(ConfigError::MultiContentWithoutImplicit.into());
        }
        let mut contributors: Vec<(CollectionKind, GroupName, Refinement)> = Vec::new();
        for (kind, per_geocell) in &self.collections {
            if !per_geocell.contains_key(&geocell) {
                continue;
            }
            if let Some(group) = self.groups.group_of_kind(*kind) {
                contributors.push((*kind, group.name, group.refine));
            }
        }
        let Some(&(_, first_group, first_refine)) = contributors.first() else {
            return Ok(BTreeMap::new());
        };
        if let Some(&(_, other, _)) = contributors.iter().find(|(_, _, r)| *r != first_refine) {
            return Err(ConfigError::ConflictingRefinement(first_group, other).into());
        }

        let mut sources: Vec<ContentSource> = Vec::new();
        let mut coarse: BTreeMap<i32, Vec<(String, TileContent)>> = BTreeMap::new();
        let mut heights = None;
        for (kind, group, _) in &contributors {
            let max_level = self.export_level_or_finest(*group);
            let per_cs = self
                .collections
                .get_mut(kind)
                .and_then(|per_geocell| per_geocell.remove(&geocell))
                .unwrap_or_default();
            for (cs, mut collection) in per_cs {
                heights = union_heights(heights, collection.heights);
                let id = format!("{}/{}", kind.dir_name(), cs.hash());
                for (level, content) in collection.coarse.range(..=max_level) {
                    coarse
                        .entry(*level)
                        .or_default()
                        .push((format!("{}/{}", id, content.uri), content.clone()));
                }
                let maximum_level = match (collection.availability.max_level(), u16::try_from(max_level)) {
                    (Some(deepest), Ok(cap)) => deepest.min(cap),
                    _ => continue,
                };
                collection.availability.truncate(maximum_level);
                let subtrees = collection
                    .availability
                    .finalize_all()
                    .into_iter()
                    .map(|s| (s.key, s))
                    .collect();
                sources.push(ContentSource {
                    template: format!("{}/{{level}}_{{x}}_{{y}}.{}", id, kind.content_extension()),
                    id,
                    subtrees,
                    maximum_level,
                });
            }
        }

        let geocell_dir = self.output.join(geocell.to_string());
        let prototype = TileAddress::new(geocell, Dataset::Elevation, CsKey::new(1, 1), 0, 0, 0);
        let (min_height, max_height) = heights.unwrap_or((0.0, 0.0));
        let mut contributions = BTreeMap::new();
        let quadtree = match sources.iter().map(|s| s.maximum_level).max() {
            Some(maximum_level) => {
                contributions = self.write_merged_subtrees(&geocell_dir, &sources)?;
                Some(Tile::implicit(
                    &prototype.bounding_region(min_height, max_height),
                    prototype.default_geometric_error(),
                    first_refine,
                    ImplicitTiling::quadtree(
                        self.config.subtree_levels,
                        maximum_level,
                        SUBTREES_TEMPLATE.to_string(),
                    ),
                    sources.iter().map(|s| s.template.clone()).collect(),
                ))
            }
            None => None,
        };
        let Some(root) = with_coarse_parents(quadtree, &coarse, &prototype, heights, first_refine) else {
            return Ok(contributions);
        };
        let tileset = Tileset::new(root);
        let path = geocell_dir.join(TILESET_FILE);
        tileset.to_file(&path)?;
        info!("Flushed {} contents of {} into {:?}", sources.len(), geocell, path);
        self.multi_content_entries.push(CombineEntry {
            path,
            region: tileset.root().region(),
            geometric_error: tileset.geometric_error(),
        });
        Ok(contributions)
    }

    /// Writes the subtrees of the sources into `<geocell_dir>/availability`, with the
    /// node and child subtree bits of all sources and one content bitstream per
    /// source. Returns the identifiers of the sources that contribute to each subtree.
    fn write_merged_subtrees(
        &self,
        geocell_dir: &Path,
        sources: &[ContentSource],
    ) -> Result<BTreeMap<SubtreeKey, Vec<String>>> {
        let engine = AvailabilityEngine::new(self.config.subtree_levels);
        let (node_length, child_length) = (engine.node_byte_length(), engine.child_byte_length());
        let zeros = vec![0_u8; node_length];
        let keys: BTreeSet<SubtreeKey> = sources
            .iter()
            .flat_map(|s| s.subtrees.keys().copied())
            .collect();
        let mut contributions = BTreeMap::new();
        for key in keys {
            let mut node_bytes = vec![0_u8; node_length];
            let mut child_bytes = vec![0_u8; child_length];
            let mut contents = Vec::with_capacity(sources.len());
            let mut ids = Vec::new();
            for source in sources {
                match source.subtrees.get(&key) {
                    Some(s) => {
                        node_bytes.iter_mut().zip(&s.node_bytes).for_each(|(a, b)| *a |= b);
                        child_bytes.iter_mut().zip(&s.child_bytes).for_each(|(a, b)| *a |= b);
                        contents.push(Bitstream::new(&s.content_bytes, s.content_count));
                        ids.push(source.id.clone());
                    }
                    None => contents.push(Bitstream::new(&zeros, 0)),
                }
            }
            let bytes = subtree::to_bytes(
                Bitstream::new(&node_bytes, count_ones(&node_bytes)),
                &contents,
                Bitstream::new(&child_bytes, count_ones(&child_bytes)),
            )?;
            write_atomically(
                geocell_dir.join(SUBTREES_DIR).join(subtree_file_name(&key)),
                &bytes,
            )?;
            contributions.insert(key, ids);
        }
        Ok(contributions)
    }

    /// Writes `<output>/<group>.json` over the tilesets of the group in all
    /// geocells. `None` if the group has no tiles.
    pub fn combine_group(&self, name: GroupName) -> Result<Option<CombineEntry>> {
        let Some(entries) = self.combine_entries.get(&name) else {
            return Ok(None);
        };
        let refine = self
            .groups
            .get(name)
            .map(|g| g.refine)
            .unwrap_or(Refinement::Replace);
        let path = self.output.join(format!("{}.json", name));
        let entry = write_combined_manifest(&path, entries, refine)?;
        if entry.is_some() {
            info!("Combined {} geocells of {} into {:?}", entries.len(), name, path);
        }
        Ok(entry)
    }

    /// Writes the root `<output>/tileset.json` over the combined tilesets of the
    /// groups. Groups without tiles are left out.
    pub fn combine_datasets(&self, names: &[GroupName]) -> Result<Option<PathBuf>> {
        let mut entries = Vec::new();
        for name in names {
            if let Some(entry) = self.combine_group(*name)? {
                entries.push(entry);
            }
        }
        let path = self.output.join(TILESET_FILE);
        Ok(write_combined_manifest(&path, &entries, Refinement::Add)?.map(|e| e.path))
    }

    /// Writes the root `<output>/tileset.json` over the multiple-contents tilesets
    /// of the geocells.
    pub fn combine_multi_content(&self) -> Result<Option<PathBuf>> {
        let path = self.output.join(TILESET_FILE);
        Ok(write_combined_manifest(&path, &self.multi_content_entries, Refinement::Add)?.map(|e| e.path))
    }
}
