// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use vdisk_types::{DiskSpec, DiskType};

/// A disk reconciliation request as read from a TOML file.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub target: Target,

    #[serde(default)]
    pub operations: OperationPolling,

    #[serde(default, rename = "disk")]
    pub disks: Vec<DiskSpec>,
}

/// The machine whose disks are being reconciled, and where its disks live
/// unless an individual disk names another datastore.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Target {
    pub machine: String,
    pub datacenter: String,
    pub datastore: String,
}

/// How often the status of a long-running remote operation is checked.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct OperationPolling {
    #[serde(default = "OperationPolling::default_initial_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "OperationPolling::default_max_ms")]
    pub max_interval_ms: u64,
}

impl OperationPolling {
    fn default_initial_ms() -> u64 {
        100
    }

    fn default_max_ms() -> u64 {
        2_000
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl Default for OperationPolling {
    fn default() -> Self {
        Self {
            initial_interval_ms: Self::default_initial_ms(),
            max_interval_ms: Self::default_max_ms(),
        }
    }
}

/// Errors which may be returned when parsing a reconciliation request.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    from_str(&contents)
}

pub fn from_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let config = Config {
            target: Target {
                machine: "vmA".to_owned(),
                datacenter: "dc1".to_owned(),
                datastore: "ds1".to_owned(),
            },
            operations: OperationPolling::default(),
            disks: vec![DiskSpec {
                create: Some(true),
                path: Some("vmA/vmA_1.vmdk".to_owned()),
                size: Some(10),
                disk_type: Some(DiskType::Thin),
                datastore_name: None,
            }],
        };
        let serialized = toml::ser::to_string(&config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
[target]
machine = "vmA"
datacenter = "dc1"
datastore = "ds1"

[operations]
max-interval-ms = 500

[[disk]]
create = true
path = "vmA/vmA_1.vmdk"
size = 10
type = "thin"

[[disk]]
create = false
path = "shared/data.vmdk"
datastoreName = "ds2"

[[disk]]
path = "vmA/no_create.vmdk"
"#;
        let cfg = from_str(raw).unwrap();

        assert_eq!(cfg.target.machine, "vmA");
        assert_eq!(cfg.operations.initial_interval_ms, 100);
        assert_eq!(cfg.operations.max_interval(), Duration::from_millis(500));
        assert_eq!(cfg.disks.len(), 3);

        assert_eq!(cfg.disks[0].disk_type, Some(DiskType::Thin));
        assert_eq!(cfg.disks[0].size, Some(10));
        assert_eq!(cfg.disks[1].create, Some(false));
        assert_eq!(cfg.disks[1].datastore_name.as_deref(), Some("ds2"));

        // Missing fields are left for the validator to report.
        assert_eq!(cfg.disks[2].create, None);
    }

    #[test]
    fn unknown_disk_type_is_a_parse_error() {
        let raw = r#"
[target]
machine = "vmA"
datacenter = "dc1"
datastore = "ds1"

[[disk]]
create = true
path = "vmA/vmA_1.vmdk"
size = 10
type = "sparse"
"#;
        assert!(matches!(from_str(raw), Err(ParseError::Toml(_))));
    }

    #[test]
    fn parse_reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disks.toml");
        std::fs::write(
            &path,
            "[target]\nmachine = \"m\"\n\
             datacenter = \"d\"\ndatastore = \"s\"\n",
        )
        .unwrap();

        let cfg = parse(&path).unwrap();
        assert!(cfg.disks.is_empty());
        assert!(matches!(
            parse(dir.path().join("missing.toml")),
            Err(ParseError::Io(_))
        ));
    }
}
