// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface to the virtualization control plane.
//!
//! Everything the reconciler knows about machines and datastores comes
//! through [`ControlPlane`]. The control plane offers no transactions and no
//! locks: mutations are submitted and return an [`OperationHandle`] whose
//! status must be polled until it settles (see [`crate::task`]).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vdisk_types::{DatastorePath, DeviceKey};

use crate::device::VirtualDevice;

/// Reference to a machine managed by the control plane.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MachineRef(String);

impl MachineRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a long-running remote operation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationHandle(pub u64);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Success,
    Error(String),
}

/// A device-level change within a reconfiguration request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceChange {
    Add(VirtualDevice),
    Remove(DeviceKey),
}

/// A persistent key-value annotation attached to a machine's configuration.
/// Setting an empty value removes the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub key: String,
    pub value: String,
}

/// A machine reconfiguration request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconfigSpec {
    pub device_changes: Vec<DeviceChange>,
    pub annotations: Vec<Annotation>,
}

/// A file found by a datastore search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreFile {
    pub path: DatastorePath,
    pub capacity_kb: u64,
}

/// How a backing file's capacity is allocated on the datastore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingProvisioning {
    Thin,
    LazyZeroedThick,
    EagerZeroedThick,
}

impl From<vdisk_types::DiskType> for BackingProvisioning {
    fn from(value: vdisk_types::DiskType) -> Self {
        match value {
            vdisk_types::DiskType::Thin => Self::Thin,
            vdisk_types::DiskType::Thick => Self::LazyZeroedThick,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterType {
    LsiLogic,
}

/// Parameters for creating a new backing file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualDiskSpec {
    pub adapter_type: AdapterType,
    pub capacity_kb: u64,
    pub provisioning: BackingProvisioning,
}

/// The files that make up a machine, as reported by a bulk property query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLayout {
    pub machine: MachineRef,
    pub files: Vec<String>,
}

/// Errors reported by the control plane itself.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("machine {0} not found")]
    MachineNotFound(MachineRef),

    #[error("datastore {0} not found")]
    DatastoreNotFound(String),

    #[error("unknown operation {0}")]
    UnknownOperation(OperationHandle),

    #[error("operation {op} failed: {message}")]
    OperationFailed { op: OperationHandle, message: String },

    #[error("operation {0} has not completed")]
    OperationPending(OperationHandle),

    #[error("{0}")]
    Fault(String),
}

/// Access to machines and datastores on a virtualization control plane.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Reads the machine's current device list.
    async fn devices(
        &self,
        vm: &MachineRef,
    ) -> Result<Vec<VirtualDevice>, ProviderError>;

    /// Submits a reconfiguration of the machine's devices and annotations.
    async fn reconfigure(
        &self,
        vm: &MachineRef,
        spec: ReconfigSpec,
    ) -> Result<OperationHandle, ProviderError>;

    async fn operation_status(
        &self,
        op: &OperationHandle,
    ) -> Result<OperationStatus, ProviderError>;

    /// Lists the files directly inside `folder` whose names match the
    /// wildcard `pattern`.
    async fn search_datastore(
        &self,
        folder: &DatastorePath,
        pattern: &str,
    ) -> Result<Vec<DatastoreFile>, ProviderError>;

    /// Returns whether a file or directory exists at `path`.
    async fn path_exists(
        &self,
        path: &DatastorePath,
    ) -> Result<bool, ProviderError>;

    /// Creates a directory. This is not a long-running operation.
    async fn make_directory(
        &self,
        datacenter: &str,
        path: &DatastorePath,
        create_parents: bool,
    ) -> Result<(), ProviderError>;

    async fn create_virtual_disk(
        &self,
        datacenter: &str,
        path: &DatastorePath,
        spec: VirtualDiskSpec,
    ) -> Result<OperationHandle, ProviderError>;

    /// Lists every machine with files on the given datastore.
    async fn machines_using_datastore(
        &self,
        datastore: &str,
    ) -> Result<Vec<MachineRef>, ProviderError>;

    /// Collects the file layout of each of the given machines in one query.
    async fn collect_file_layouts(
        &self,
        machines: &[MachineRef],
    ) -> Result<Vec<FileLayout>, ProviderError>;

    async fn annotation(
        &self,
        vm: &MachineRef,
        key: &str,
    ) -> Result<Option<String>, ProviderError>;
}
