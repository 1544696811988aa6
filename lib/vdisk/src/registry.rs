// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The record of which backing files a machine had attached on its behalf.
//!
//! The device list alone cannot distinguish disks attached here from disks
//! attached by some other means, so attached paths are kept in a machine
//! annotation: a comma-separated list of datastore-qualified paths.

use slog::{warn, Logger};
use vdisk_types::DatastorePath;

use crate::error::Error;
use crate::provider::{Annotation, ControlPlane, MachineRef};

/// Annotation key under which attached disks are recorded.
pub const ATTACHED_DISKS_KEY: &str = "AttachedDisks";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachmentRegistry {
    paths: Vec<DatastorePath>,
}

impl AttachmentRegistry {
    /// Reads the registry for `vm`. A machine without the annotation has an
    /// empty registry.
    pub async fn load(
        control_plane: &dyn ControlPlane,
        vm: &MachineRef,
        log: &Logger,
    ) -> Result<Self, Error> {
        let value = control_plane
            .annotation(vm, ATTACHED_DISKS_KEY)
            .await
            .map_err(Error::provider(format!("reading {ATTACHED_DISKS_KEY}")))?;
        Ok(value.map(|v| Self::parse(&v, log)).unwrap_or_default())
    }

    /// Parses an annotation value. Entries that are not datastore paths are
    /// dropped with a warning.
    pub fn parse(value: &str, log: &Logger) -> Self {
        let mut registry = Self::default();
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty())
        {
            match entry.parse::<DatastorePath>() {
                Ok(path) => {
                    registry.insert(path);
                }
                Err(e) => {
                    warn!(log, "ignoring malformed registry entry";
                        "entry" => entry,
                        "error" => %e,
                    );
                }
            }
        }
        registry
    }

    /// Adds `path`, returning false if it was already recorded.
    pub fn insert(&mut self, path: DatastorePath) -> bool {
        if self.contains(&path) {
            return false;
        }
        self.paths.push(path);
        true
    }

    pub fn remove(&mut self, path: &DatastorePath) -> bool {
        let before = self.paths.len();
        self.paths.retain(|p| p != path);
        before != self.paths.len()
    }

    pub fn contains(&self, path: &DatastorePath) -> bool {
        self.paths.contains(path)
    }

    pub fn paths(&self) -> &[DatastorePath] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// The annotation that stores this registry.
    pub fn annotation(&self) -> Annotation {
        let value = self
            .paths
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Annotation { key: ATTACHED_DISKS_KEY.to_owned(), value }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::{o, Discard};

    #[test]
    fn parse_and_serialize() {
        let log = Logger::root(Discard, o!());
        let registry = AttachmentRegistry::parse(
            "[ds1] vmA/vmA_1.vmdk,[ds2] shared/data.vmdk, ,not-a-path,\
             [ds1] vmA/vmA_1.vmdk",
            &log,
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.annotation().value,
            "[ds1] vmA/vmA_1.vmdk,[ds2] shared/data.vmdk"
        );
        assert_eq!(registry.annotation().key, ATTACHED_DISKS_KEY);
    }

    #[test]
    fn insert_and_remove() {
        let mut registry = AttachmentRegistry::default();
        let path = DatastorePath::new("ds1", "vm/disk.vmdk");
        assert!(registry.insert(path.clone()));
        assert!(!registry.insert(path.clone()));
        assert!(registry.contains(&path));
        assert!(registry.remove(&path));
        assert!(!registry.remove(&path));
        assert!(registry.is_empty());
        assert_eq!(registry.annotation().value, "");
    }
}
