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
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use cdbtiles::address::TileAddress;
use cdbtiles::cli::Cli;
use cdbtiles::collection::{collection_directory, CollectionKind, GroupName, TileContent, TilesetBuilder};
use cdbtiles::config::Config;
use cdbtiles::error::{Error, Result};
use cdbtiles::formats::container::{Composite, InstanceAttributes, Payload, TileContainer};
use cdbtiles::formats::write_atomically;
use cdbtiles::queue::{DiscoveredTile, TileQueue};

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = Config::try_from(&cli)?;
    debug!("{:?}", &config);

    if cli.output.is_dir() {
        fs::remove_dir_all(&cli.output)?;
        info!("Removed the existing output directory {:#?}", &cli.output);
    }
    let mut builder = TilesetBuilder::new(config.clone(), &cli.output)?;

    let tiles = discover_tiles(&cli.input);
    info!("Found {} tiles in {:#?}", tiles.len(), &cli.input);

    // The workers wrap the models in containers, this thread collects the tiles.
    let queue = TileQueue::new();
    let sink = queue
        .sink()
        .ok_or("the tile queue is closed before the first tile")?;
    let output = cli.output.clone();
    let report = std::thread::scope(|s| {
        s.spawn(move || {
            tiles
                .into_par_iter()
                .for_each_with(sink, |sink, (address, variants)| {
                    match wrap_tile(&output, &address, &variants) {
                        Ok(tile) => {
                            sink.push(tile);
                        }
                        Err(e) => error!("Could not convert {}: {}", address, e),
                    }
                });
        });
        queue.drain_until_closed(&mut builder)
    });
    info!(
        "Collected {} tiles, skipped {} invalid tiles",
        report.inserted, report.skipped
    );

    for geocell in builder.geocells() {
        let result = if config.multi_content {
            builder.flush_multi_content(geocell).map(|contributions| {
                debug!("{} has {} subtrees", geocell, contributions.len());
            })
        } else {
            GroupName::ALL
                .into_iter()
                .try_for_each(|group| builder.flush_dataset_group(geocell, group).map(|_| ()))
        };
        match result {
            Ok(()) => {}
            Err(Error::Config(e)) => return Err(e.into()),
            Err(e) => error!("Could not write the tilesets of {}: {}", geocell, e),
        }
    }

    let root = if config.multi_content {
        builder.combine_multi_content()?
    } else {
        builder.combine_datasets(&config.combine_groups())?
    };
    match root {
        Some(path) => info!("Wrote {:#?}", path),
        None => warn!("No tiles were converted, there is no root tileset"),
    }
    info!("Done");
    Ok(())
}

/// The `.glb` files of the staging directory, grouped by tile address. The variants
/// of a tile are sorted by path.
fn discover_tiles(input: &Path) -> Vec<(TileAddress, Vec<PathBuf>)> {
    let mut tiles: BTreeMap<TileAddress, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(input).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot access {}", e);
                continue;
            }
        };
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "glb") {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        let address = file_name
            .parse::<TileAddress>()
            .and_then(|address| address.validate().map(|_| address));
        match address {
            Ok(address) => tiles.entry(address).or_default().push(path.to_path_buf()),
            Err(e) => warn!("Skipping {:?}: {}", path, e),
        }
    }
    tiles.into_iter().collect()
}

/// One container of a model, instanced if it has an `.instances.json` next to it.
fn container(glb_path: &Path) -> Result<Vec<u8>> {
    let glb = fs::read(glb_path)?;
    let instances_path = glb_path.with_extension("instances.json");
    let container = if instances_path.is_file() {
        let instances: InstanceAttributes = serde_json::from_slice(&fs::read(&instances_path)?)?;
        let batch_table = instances.batch_table()?;
        TileContainer::instanced(Payload::Binary(glb), &instances, batch_table.as_ref())?
    } else {
        TileContainer::batched(glb, None, None)?
    };
    container.to_bytes()
}

/// Wraps the variants of a tile and writes the content file into its collection.
fn wrap_tile(output: &Path, address: &TileAddress, variants: &[PathBuf]) -> Result<DiscoveredTile> {
    let extension = CollectionKind::of(address.dataset).content_extension();
    let bytes = if extension == "cmpt" {
        let inner = variants.iter().map(|p| container(p)).collect::<Result<Vec<_>>>()?;
        Composite::new(inner).to_bytes()?
    } else {
        if variants.len() > 1 {
            warn!(
                "{} has {} variants, only {:?} is kept",
                address,
                variants.len(),
                variants[0]
            );
        }
        let first = variants
            .first()
            .ok_or_else(|| Error::Malformed(format!("{} has no model", address)))?;
        container(first)?
    };
    let file_name = address.content_file_name(extension);
    write_atomically(collection_directory(output, address).join(&file_name), &bytes)?;
    debug!("Converted {} with {} variants", address, variants.len());
    Ok(DiscoveredTile::new(*address, TileContent::new(file_name)))
}
