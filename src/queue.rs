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
//! Concurrent ingestion of tiles.
//!
//! The model builders run in parallel and push the tiles they produce into a
//! [TileSink]. A single consumer drains the queue into the [TilesetBuilder], so the
//! availability engines only ever have one writer. The tiles of one producer arrive
//! in the order they were pushed. The order across producers is arbitrary, and the
//! availability does not depend on it.
use crossbeam_channel::{self as channel, Receiver, Sender, TryRecvError};
use log::{debug, warn};

use crate::address::TileAddress;
use crate::collection::{TileContent, TilesetBuilder};

/// A tile that was produced by a model builder.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTile {
    pub address: TileAddress,
    pub content: TileContent,
}

impl DiscoveredTile {
    pub fn new(address: TileAddress, content: TileContent) -> Self {
        Self { address, content }
    }
}

/// Producer side of a [TileQueue]. Cheap to clone, one clone per worker.
#[derive(Debug, Clone)]
pub struct TileSink {
    sender: Sender<DiscoveredTile>,
}

impl TileSink {
    /// Returns `false` if the queue was dropped and the tile is lost.
    pub fn push(&self, tile: DiscoveredTile) -> bool {
        self.sender.send(tile).is_ok()
    }
}

/// What a drain did with the received tiles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub inserted: usize,
    /// Invalid tiles, which were logged and left out.
    pub skipped: usize,
}

/// Multi-producer single-consumer queue of tiles.
#[derive(Debug)]
pub struct TileQueue {
    sender: Option<Sender<DiscoveredTile>>,
    receiver: Receiver<DiscoveredTile>,
}

impl Default for TileQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TileQueue {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender: Some(sender),
            receiver,
        }
    }

    /// A new producer handle. `None` once the queue is closed for new producers by
    /// [Self::drain_until_closed].
    pub fn sink(&self) -> Option<TileSink> {
        self.sender.as_ref().map(|sender| TileSink {
            sender: sender.clone(),
        })
    }

    fn insert(builder: &mut TilesetBuilder, tile: DiscoveredTile, report: &mut DrainReport) {
        match builder.insert_tile(tile.address, tile.content) {
            Ok(()) => report.inserted += 1,
            Err(e) => {
                warn!("Skipping tile {}: {}", tile.address, e);
                report.skipped += 1;
            }
        }
    }

    /// Inserts the tiles that are queued right now, without waiting for more.
    pub fn drain(&self, builder: &mut TilesetBuilder) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            match self.receiver.try_recv() {
                Ok(tile) => Self::insert(builder, tile, &mut report),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        report
    }

    /// Inserts tiles until every [TileSink] is dropped and the queue is empty.
    pub fn drain_until_closed(mut self, builder: &mut TilesetBuilder) -> DrainReport {
        self.sender = None;
        let mut report = DrainReport::default();
        for tile in self.receiver.iter() {
            Self::insert(builder, tile, &mut report);
        }
        debug!(
            "Tile queue closed after {} tiles, {} skipped",
            report.inserted, report.skipped
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{CsKey, Dataset, GeoCell, MIN_LEVEL};
    use crate::availability::AvailabilityEngine;
    use crate::collection::CollectionKind;
    use crate::config::Config;
    use rayon::prelude::*;

    fn tile(level: i32, x: u32, y: u32) -> DiscoveredTile {
        let address = TileAddress::new(
            GeoCell::new(52, 4),
            Dataset::Elevation,
            CsKey::new(1, 1),
            level,
            x,
            y,
        );
        let uri = address.content_file_name("b3dm");
        DiscoveredTile::new(address, TileContent::new(uri))
    }

    fn tiles() -> Vec<DiscoveredTile> {
        let mut tiles = Vec::new();
        for level in 0..4_i32 {
            let side = 1_u32 << level;
            for x in 0..side {
                for y in (0..side).filter(|y| (x + y) % 3 == 0) {
                    tiles.push(tile(level, x, y));
                }
            }
        }
        tiles
    }

    #[test]
    fn test_drain_skips_invalid_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = TilesetBuilder::new(Config::default(), dir.path()).unwrap();
        let queue = TileQueue::new();
        let sink = queue.sink().unwrap();
        assert!(sink.push(tile(1, 1, 0)));
        assert!(sink.push(tile(1, 2, 0)));
        assert!(sink.push(tile(1, 1, 0)));
        let report = queue.drain(&mut builder);
        assert_eq!(report, DrainReport { inserted: 2, skipped: 1 });
        assert_eq!(queue.drain(&mut builder), DrainReport::default());

        drop(sink);
        assert_eq!(queue.drain_until_closed(&mut builder), DrainReport::default());
    }

    #[test]
    fn test_push_after_close() {
        let queue = TileQueue::new();
        let sink = queue.sink().unwrap();
        drop(queue);
        assert!(!sink.push(tile(0, 0, 0)));
    }

    /// Many producers end up with the same availability as a single thread.
    #[test]
    fn test_concurrent_producers() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = TilesetBuilder::new(Config::default(), dir.path()).unwrap();
        let queue = TileQueue::new();
        let sink = queue.sink().unwrap();
        let tiles = tiles();

        let report = std::thread::scope(|s| {
            let producers = tiles.clone();
            s.spawn(move || {
                producers
                    .into_par_iter()
                    .for_each_with(sink, |sink, tile| {
                        sink.push(tile);
                    });
            });
            queue.drain_until_closed(&mut builder)
        });
        assert_eq!(report.inserted, tiles.len());
        assert_eq!(report.skipped, 0);

        let mut expected = AvailabilityEngine::new(Config::default().subtree_levels);
        for t in &tiles {
            expected.add_availability(&t.address.node().unwrap());
        }
        let first = tiles[0].address;
        let collection = builder
            .collection(CollectionKind::Elevation, first.geocell, first.cs_key())
            .unwrap();
        assert_eq!(collection.tile_count(), tiles.len());
        for level in 0..6_i32 {
            let side = 1_u32 << level;
            for x in 0..side {
                for y in 0..side {
                    let address = TileAddress { level, x, y, ..first };
                    assert_eq!(
                        collection.is_available(&address),
                        expected.is_available(&address.node().unwrap()),
                        "{}",
                        address
                    );
                }
            }
        }
        // The coarse levels lead to the quadtree.
        for level in MIN_LEVEL..0 {
            assert!(collection.is_available(&first.with_coarse_level(level)));
        }
    }
}
