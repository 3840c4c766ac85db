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
//! Settings of one conversion run. They are validated once and do not change
//! afterwards.
use crate::address::{MAX_LEVEL, MIN_LEVEL};
use crate::cli::Cli;
use crate::collection::GroupName;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Levels per subtree of the implicit tiling.
    pub subtree_levels: u16,
    /// Write implicit tilesets with subtree files instead of explicit tile trees.
    pub use_3dtiles_next: bool,
    /// Merge the dataset groups of a geocell into one multiple-contents tileset.
    pub multi_content: bool,
    /// The finest CDB level that is exported.
    pub max_level: Option<i32>,
    pub elevation_normal: bool,
    pub elevation_lod: bool,
    pub elevation_decimate_error: f32,
    pub elevation_threshold_indices: f32,
    /// Dataset groups of the root tileset. Empty means all.
    pub combine: Vec<GroupName>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subtree_levels: 7,
            use_3dtiles_next: false,
            multi_content: false,
            max_level: None,
            elevation_normal: false,
            elevation_lod: false,
            elevation_decimate_error: 0.01,
            elevation_threshold_indices: 0.3,
            combine: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(1..=16).contains(&self.subtree_levels) {
            return Err(ConfigError::SubtreeLevels(self.subtree_levels as u32));
        }
        if let Some(level) = self.max_level {
            if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
                return Err(ConfigError::MaxLevel(level));
            }
        }
        for (name, value) in [
            ("elevation decimate error", self.elevation_decimate_error),
            ("elevation threshold indices", self.elevation_threshold_indices),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { name, value });
            }
        }
        if self.multi_content && !self.use_3dtiles_next {
            return Err(ConfigError::MultiContentWithoutImplicit);
        }
        Ok(self)
    }

    /// The groups of the root tileset.
    pub fn combine_groups(&self) -> Vec<GroupName> {
        if self.combine.is_empty() {
            GroupName::ALL.to_vec()
        } else {
            self.combine.clone()
        }
    }
}

impl TryFrom<&Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let subtree_levels = u16::try_from(cli.subtree_levels)
            .map_err(|_| ConfigError::SubtreeLevels(cli.subtree_levels))?;
        Config {
            subtree_levels,
            use_3dtiles_next: cli.cesium3dtiles_next,
            multi_content: cli.multi_content,
            max_level: cli.max_level,
            elevation_normal: cli.elevation_normal,
            elevation_lod: cli.elevation_lod,
            elevation_decimate_error: cli.elevation_decimate_error,
            elevation_threshold_indices: cli.elevation_threshold_indices,
            combine: cli.combine.clone(),
        }
        .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default().validate().unwrap();
        assert_eq!(config.subtree_levels, 7);
        assert_eq!(config.combine_groups(), GroupName::ALL.to_vec());
    }

    #[test]
    fn test_invalid_values() {
        let c = Config {
            subtree_levels: 0,
            ..Default::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::SubtreeLevels(0)));
        let c = Config {
            subtree_levels: 17,
            ..Default::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::SubtreeLevels(17)));
        let c = Config {
            max_level: Some(-11),
            ..Default::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::MaxLevel(-11)));
        let c = Config {
            elevation_threshold_indices: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfUnitRange { .. })
        ));
        let c = Config {
            multi_content: true,
            ..Default::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::MultiContentWithoutImplicit));
    }

    #[test]
    fn test_from_cli() {
        let dir = env!("CARGO_MANIFEST_DIR");
        let cli = Cli::try_parse_from([
            "cdbtiles",
            "-i",
            dir,
            "-o",
            dir,
            "--subtree-levels",
            "5",
            "--combine",
            "elevation",
        ])
        .unwrap();
        let config = Config::try_from(&cli).unwrap();
        assert_eq!(config.subtree_levels, 5);
        assert_eq!(config.combine_groups(), vec![GroupName::Elevation]);

        let cli = Cli::try_parse_from(["cdbtiles", "-i", dir, "-o", dir, "--subtree-levels", "70000"])
            .unwrap();
        assert_eq!(
            Config::try_from(&cli),
            Err(ConfigError::SubtreeLevels(70000))
        );
    }
}
