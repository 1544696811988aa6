// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the vdisk crates.
//!
//! This crate defines the declarative disk description and the path types
//! that the configuration crate, the reconciliation library, and the
//! command-line front end all need to agree on.

use std::fmt::Display;
use std::str::FromStr;

use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum number of SCSI controllers a machine may carry.
pub const MAX_SCSI_CONTROLLERS: usize = 4;

/// Number of disks a single SCSI controller can host.
pub const SCSI_DISKS_PER_CONTROLLER: usize = 15;

/// Highest addressable unit number on a SCSI bus.
pub const MAX_UNIT_NUMBER: u8 = 15;

/// Key the control plane uses to identify a device on a machine.
pub type DeviceKey = i32;

/// Device key of a SCSI controller.
pub type ControllerKey = DeviceKey;

/// Address of a device on its controller's bus.
pub type UnitNumber = u8;

/// How a newly created backing file allocates its capacity.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Thin,
    Thick,
}

impl FromStr for DiskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thin" => Ok(Self::Thin),
            "thick" => Ok(Self::Thick),
            other => Err(format!(
                "unknown disk type \"{other}\", expected \"thin\" or \"thick\""
            )),
        }
    }
}

impl Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thin => write!(f, "thin"),
            Self::Thick => write!(f, "thick"),
        }
    }
}

/// One desired disk, as written by the user.
///
/// Every field is optional here so that a missing `create` can be reported
/// as a configuration error instead of a deserialization failure.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct DiskSpec {
    /// Whether the backing file should be created if it does not exist.
    pub create: Option<bool>,

    /// Path of the backing file relative to the datastore root, e.g.
    /// `vm/vm_1.vmdk`.
    pub path: Option<String>,

    /// Requested size. Multiplied by 1024 to obtain the capacity in KB.
    pub size: Option<u64>,

    #[serde(rename = "type")]
    pub disk_type: Option<DiskType>,

    /// Overrides the target's default datastore for this disk.
    #[serde(alias = "datastoreName")]
    pub datastore_name: Option<String>,
}

/// Errors produced when parsing datastore and disk paths.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error(
        "incorrect path format \"{0}\", expected path/to/folder/disk_name"
    )]
    TooFewSegments(String),

    #[error("\"{0}\" is not a datastore path, expected \"[datastore] path\"")]
    NotQualified(String),
}

/// A path relative to a datastore root, split into its folder and the file
/// name within it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskPath {
    folder: String,
    file_name: String,
}

impl DiskPath {
    #[inline]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    #[inline]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl FromStr for DiskPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((folder, file_name))
                if !file_name.is_empty()
                    && folder.split('/').all(|seg| !seg.is_empty()) =>
            {
                Ok(Self {
                    folder: folder.to_owned(),
                    file_name: file_name.to_owned(),
                })
            }
            _ => Err(PathError::TooFewSegments(s.to_owned())),
        }
    }
}

impl Display for DiskPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.folder, self.file_name)
    }
}

/// A datastore-qualified path of the form `[datastore] relative/path`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DatastorePath {
    datastore: String,
    path: String,
}

impl DatastorePath {
    pub fn new(datastore: impl Into<String>, path: impl Into<String>) -> Self {
        Self { datastore: datastore.into(), path: path.into() }
    }

    #[inline]
    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns true if `other` names this path or something nested beneath
    /// it, compared as qualified strings.
    pub fn is_prefix_of(&self, other: &str) -> bool {
        other.starts_with(&self.to_string())
    }
}

impl FromStr for DatastorePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let not_qualified = || PathError::NotQualified(s.to_owned());
        let rest = s.strip_prefix('[').ok_or_else(not_qualified)?;
        let (datastore, path) = rest.split_once(']').ok_or_else(not_qualified)?;
        if datastore.is_empty() {
            return Err(not_qualified());
        }

        Ok(Self::new(datastore, path.trim_start()))
    }
}

impl Display for DatastorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}]", self.datastore)
        } else {
            write!(f, "[{}] {}", self.datastore, self.path)
        }
    }
}

impl Serialize for DatastorePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// Serialized as its string form.
impl JsonSchema for DatastorePath {
    fn schema_name() -> String {
        "DatastorePath".to_owned()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

impl<'d> Deserialize<'d> for DatastorePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}
