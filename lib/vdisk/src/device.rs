// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices as reported by the control plane for a single machine.

use serde::{Deserialize, Serialize};
use vdisk_types::{ControllerKey, DatastorePath, DeviceKey, UnitNumber};

/// Key used in a reconfiguration request to ask the control plane to pick
/// the new device's key itself.
pub const PROVIDER_ASSIGNED_KEY: DeviceKey = -1;

/// Whether a controller's bus may be shared with other machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusSharing {
    NoSharing,
    Virtual,
    Physical,
}

/// The emulated adapter behind a SCSI controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerModel {
    LsiLogic,
    LsiLogicSas,
    Paravirtual,
    BusLogic,
}

/// What a device is, decided once when the device list is read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    ScsiController {
        model: ControllerModel,
        bus_number: u8,
        sharing: BusSharing,
        /// The slot the controller itself occupies on its own bus, if the
        /// control plane reports one.
        scsi_unit_number: Option<UnitNumber>,
    },
    Disk {
        backing: DatastorePath,
        capacity_kb: u64,
    },
    Other {
        description: String,
    },
}

/// One entry in a machine's device list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub key: DeviceKey,

    #[serde(default)]
    pub label: String,

    /// Key of the controller this device hangs off, if any.
    #[serde(default)]
    pub controller_key: Option<ControllerKey>,

    /// Address of this device on its controller.
    #[serde(default)]
    pub unit_number: Option<UnitNumber>,

    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl VirtualDevice {
    /// Describes a new disk backed by `backing`, to be added at
    /// `unit_number` on `controller_key`.
    pub fn new_disk(
        backing: DatastorePath,
        capacity_kb: u64,
        controller_key: ControllerKey,
        unit_number: UnitNumber,
    ) -> Self {
        Self {
            key: PROVIDER_ASSIGNED_KEY,
            label: String::new(),
            controller_key: Some(controller_key),
            unit_number: Some(unit_number),
            kind: DeviceKind::Disk { backing, capacity_kb },
        }
    }

    /// Describes a new LSI Logic SCSI controller with sharing disabled.
    pub fn new_scsi_controller(key: ControllerKey, bus_number: u8) -> Self {
        Self {
            key,
            label: String::new(),
            controller_key: None,
            unit_number: None,
            kind: DeviceKind::ScsiController {
                model: ControllerModel::LsiLogic,
                bus_number,
                sharing: BusSharing::NoSharing,
                scsi_unit_number: None,
            },
        }
    }

    /// Returns the device's backing file if it is a disk.
    pub fn disk_backing(&self) -> Option<&DatastorePath> {
        match &self.kind {
            DeviceKind::Disk { backing, .. } => Some(backing),
            _ => None,
        }
    }
}
