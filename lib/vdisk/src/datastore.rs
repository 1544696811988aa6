// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backing files in datastores: finding them, and creating them.

use slog::{info, Logger};
use vdisk_types::{DatastorePath, DiskPath, DiskType};

use crate::error::Error;
use crate::provider::{AdapterType, ControlPlane, VirtualDiskSpec};
use crate::task::OperationWaiter;

/// A backing file as it exists in a datastore, whether or not any machine
/// has it attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualDiskRecord {
    pub path: DatastorePath,
    pub capacity_kb: u64,
}

impl VirtualDiskRecord {
    pub fn datastore_name(&self) -> &str {
        self.path.datastore()
    }
}

/// Resolves declared paths to existing backing files.
pub struct DiskLocator<'a> {
    control_plane: &'a dyn ControlPlane,
}

impl<'a> DiskLocator<'a> {
    pub fn new(control_plane: &'a dyn ControlPlane) -> Self {
        Self { control_plane }
    }

    /// Looks for the file at `path` in `datastore`. Returns `None` if it does
    /// not exist; more than one match means the datastore is inconsistent.
    pub async fn find(
        &self,
        datastore: &str,
        path: &str,
    ) -> Result<Option<VirtualDiskRecord>, Error> {
        let path: DiskPath = path.parse()?;
        self.find_path(datastore, &path).await
    }

    pub async fn find_path(
        &self,
        datastore: &str,
        path: &DiskPath,
    ) -> Result<Option<VirtualDiskRecord>, Error> {
        let folder = DatastorePath::new(datastore, path.folder());

        // Searching a folder that does not exist is an error on most control
        // planes; a missing folder simply means a missing disk.
        let folder_exists = self
            .control_plane
            .path_exists(&folder)
            .await
            .map_err(Error::provider(format!("checking for {folder}")))?;
        if !folder_exists {
            return Ok(None);
        }

        let mut files = self
            .control_plane
            .search_datastore(&folder, path.file_name())
            .await
            .map_err(Error::provider(format!("searching {folder}")))?;

        match files.len() {
            0 => Ok(None),
            1 => {
                let file = files.remove(0);
                Ok(Some(VirtualDiskRecord {
                    path: file.path,
                    capacity_kb: file.capacity_kb,
                }))
            }
            count => Err(Error::DuplicateDisk {
                path: DatastorePath::new(datastore, path.to_string()),
                count,
            }),
        }
    }
}

/// Makes sure the folder that will hold `path` exists, creating it and any
/// missing parents otherwise.
pub async fn ensure_folder(
    control_plane: &dyn ControlPlane,
    datacenter: &str,
    datastore: &str,
    path: &DiskPath,
    log: &Logger,
) -> Result<(), Error> {
    let folder = DatastorePath::new(datastore, path.folder());
    let exists = control_plane
        .path_exists(&folder)
        .await
        .map_err(Error::provider(format!("checking for {folder}")))?;
    if exists {
        return Ok(());
    }

    info!(log, "creating folder"; "folder" => %folder);
    control_plane
        .make_directory(datacenter, &folder, true)
        .await
        .map_err(Error::provider(format!("creating directory {folder}")))
}

/// Provisions new backing files.
pub struct DiskCreator<'a> {
    control_plane: &'a dyn ControlPlane,
    waiter: &'a OperationWaiter,
    log: &'a Logger,
}

impl<'a> DiskCreator<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        waiter: &'a OperationWaiter,
        log: &'a Logger,
    ) -> Self {
        Self { control_plane, waiter, log }
    }

    /// Creates the backing file at `path` unless one already exists there.
    /// Returns the file's datastore-qualified path either way.
    pub async fn ensure(
        &self,
        datastore: &str,
        path: &DiskPath,
        size_kb: u64,
        disk_type: DiskType,
        datacenter: &str,
    ) -> Result<DatastorePath, Error> {
        let full_path = DatastorePath::new(datastore, path.to_string());

        let exists = self
            .control_plane
            .path_exists(&full_path)
            .await
            .map_err(Error::provider(format!("checking for {full_path}")))?;
        if exists {
            return Ok(full_path);
        }

        let spec = VirtualDiskSpec {
            adapter_type: AdapterType::LsiLogic,
            capacity_kb: size_kb,
            provisioning: disk_type.into(),
        };
        info!(self.log, "creating virtual disk";
            "path" => %full_path,
            "capacity_kb" => size_kb,
            "type" => %disk_type,
        );

        let context = format!("creating virtual disk {full_path}");
        let op = self
            .control_plane
            .create_virtual_disk(datacenter, &full_path, spec)
            .await
            .map_err(Error::provider(&context))?;
        self.waiter
            .wait(self.control_plane, &op, self.log)
            .await
            .map_err(Error::provider(&context))?;

        Ok(full_path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::{DatastoreFile, MockControlPlane, ProviderError};
    use slog::{o, Discard};

    fn file(path: &str, capacity_kb: u64) -> DatastoreFile {
        DatastoreFile {
            path: DatastorePath::new("ds1", path),
            capacity_kb,
        }
    }

    #[tokio::test]
    async fn locator_rejects_single_segment_paths() {
        let cp = MockControlPlane::new();
        let err =
            DiskLocator::new(&cp).find("ds1", "disk.vmdk").await.unwrap_err();
        assert!(matches!(err, Error::PathFormat(_)));
    }

    #[tokio::test]
    async fn locator_searches_the_parent_folder() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists()
            .withf(|path| path.to_string() == "[ds1] a/b")
            .returning(|_| Ok(true));
        cp.expect_search_datastore()
            .withf(|folder, pattern| {
                folder.to_string() == "[ds1] a/b" && pattern == "disk.vmdk"
            })
            .returning(|_, _| Ok(vec![file("a/b/disk.vmdk", 2048)]));

        let record =
            DiskLocator::new(&cp).find("ds1", "a/b/disk.vmdk").await.unwrap();
        assert_eq!(
            record,
            Some(VirtualDiskRecord {
                path: DatastorePath::new("ds1", "a/b/disk.vmdk"),
                capacity_kb: 2048,
            })
        );
    }

    #[tokio::test]
    async fn locator_missing_folder_means_missing_disk() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists().returning(|_| Ok(false));
        let record =
            DiskLocator::new(&cp).find("ds1", "vm/disk.vmdk").await.unwrap();
        assert_eq!(record, None);
    }

    #[tokio::test]
    async fn locator_duplicate_match_is_a_conflict() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists().returning(|_| Ok(true));
        cp.expect_search_datastore().returning(|_, _| {
            Ok(vec![file("vm/disk.vmdk", 1), file("vm/disk.vmdk", 1)])
        });
        let err = DiskLocator::new(&cp)
            .find("ds1", "vm/disk.vmdk")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDisk { count: 2, .. }));
    }

    #[tokio::test]
    async fn folder_creation_fault_is_reported() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists().returning(|_| Ok(false));
        cp.expect_make_directory()
            .withf(|dc, path, parents| {
                dc == "dc1" && path.path() == "vm/sub" && *parents
            })
            .returning(|_, _, _| {
                Err(ProviderError::Fault("permission denied".to_owned()))
            });

        let log = Logger::root(Discard, o!());
        let path: DiskPath = "vm/sub/disk.vmdk".parse().unwrap();
        let err = ensure_folder(&cp, "dc1", "ds1", &path, &log)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderFault { .. }));
    }

    #[tokio::test]
    async fn creator_skips_existing_files() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists().returning(|_| Ok(true));
        // No create_virtual_disk expectation: calling it would panic.

        let log = Logger::root(Discard, o!());
        let waiter = OperationWaiter::default();
        let path: DiskPath = "vm/disk.vmdk".parse().unwrap();
        let created = DiskCreator::new(&cp, &waiter, &log)
            .ensure("ds1", &path, 10240, DiskType::Thin, "dc1")
            .await
            .unwrap();
        assert_eq!(created.to_string(), "[ds1] vm/disk.vmdk");
    }
}
