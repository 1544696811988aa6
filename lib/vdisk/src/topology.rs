// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SCSI bus layout of a machine, derived from its device list.
//!
//! A [`ScsiTopology`] is a snapshot. Any mutation of the machine's devices
//! invalidates it, so callers rebuild it from a fresh device list rather than
//! keeping one across a reconfiguration.

use std::collections::BTreeMap;

use slog::{debug, Logger};
use vdisk_types::{
    ControllerKey, DatastorePath, DeviceKey, UnitNumber, MAX_SCSI_CONTROLLERS,
    MAX_UNIT_NUMBER, SCSI_DISKS_PER_CONTROLLER,
};

use crate::device::{DeviceKind, VirtualDevice};

/// A SCSI controller as seen in the topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiController {
    pub key: ControllerKey,
    pub label: String,
    pub bus_number: u8,
    pub unit_number: Option<UnitNumber>,
}

impl ScsiController {
    pub const CAPACITY: usize = SCSI_DISKS_PER_CONTROLLER;
}

/// A disk attached to a SCSI controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualDiskDevice {
    pub key: DeviceKey,
    pub unit_number: Option<UnitNumber>,
    pub backing: DatastorePath,
    pub capacity_kb: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerEntry {
    pub controller: ScsiController,
    pub children: Vec<VirtualDiskDevice>,
}

impl ControllerEntry {
    pub fn is_full(&self) -> bool {
        self.children.len() >= ScsiController::CAPACITY
    }

    /// Returns the lowest unit number on this controller that neither the
    /// controller itself nor any of its disks occupies.
    ///
    /// The controller's own reported slot (conventionally 7) counts as
    /// occupied exactly as reported; there is no separate reservation.
    pub fn free_unit_number(&self) -> Option<UnitNumber> {
        let mut occupied = [false; MAX_UNIT_NUMBER as usize + 1];
        let reported = self
            .controller
            .unit_number
            .into_iter()
            .chain(self.children.iter().filter_map(|disk| disk.unit_number));
        for unit in reported.filter(|unit| *unit <= MAX_UNIT_NUMBER) {
            occupied[unit as usize] = true;
        }

        (0..=MAX_UNIT_NUMBER).find(|unit| !occupied[*unit as usize])
    }
}

/// Map of controller key to the controller and the disks attached to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScsiTopology {
    controllers: BTreeMap<ControllerKey, ControllerEntry>,
}

impl ScsiTopology {
    /// Builds the topology from a machine's device list.
    ///
    /// Disks whose controller is not a SCSI controller (IDE, SATA, NVMe) are
    /// not part of the SCSI topology and are left out.
    pub fn build(devices: &[VirtualDevice], log: &Logger) -> Self {
        let mut controllers = BTreeMap::new();
        let mut disks = Vec::new();

        for device in devices {
            match &device.kind {
                DeviceKind::ScsiController {
                    bus_number, scsi_unit_number, ..
                } => {
                    let controller = ScsiController {
                        key: device.key,
                        label: device.label.clone(),
                        bus_number: *bus_number,
                        unit_number: *scsi_unit_number,
                    };
                    controllers.insert(
                        device.key,
                        ControllerEntry { controller, children: Vec::new() },
                    );
                }
                DeviceKind::Disk { backing, capacity_kb } => {
                    disks.push((
                        device.controller_key,
                        VirtualDiskDevice {
                            key: device.key,
                            unit_number: device.unit_number,
                            backing: backing.clone(),
                            capacity_kb: *capacity_kb,
                        },
                    ));
                }
                DeviceKind::Other { .. } => {}
            }
        }

        // Disks may precede their controller in the device list, so they are
        // placed once every controller is known.
        for (controller_key, disk) in disks {
            match controller_key.and_then(|key| controllers.get_mut(&key)) {
                Some(entry) => entry.children.push(disk),
                None => {
                    debug!(log, "disk is not on a SCSI controller";
                        "disk" => disk.key,
                        "controller" => ?controller_key,
                    );
                }
            }
        }

        Self { controllers }
    }

    /// Iterates controllers in ascending key order.
    pub fn controllers(&self) -> impl Iterator<Item = &ControllerEntry> {
        self.controllers.values()
    }

    pub fn get(&self, key: ControllerKey) -> Option<&ControllerEntry> {
        self.controllers.get(&key)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Returns true if a disk could be placed, either on an existing
    /// controller or on one that could still be created.
    pub fn has_capacity(&self) -> bool {
        self.len() < MAX_SCSI_CONTROLLERS
            || self.controllers().any(|entry| !entry.is_full())
    }

    /// Finds the attached disk backed by `path`, if any.
    pub fn find_disk(
        &self,
        path: &DatastorePath,
    ) -> Option<&VirtualDiskDevice> {
        self.controllers()
            .flat_map(|entry| entry.children.iter())
            .find(|disk| &disk.backing == path)
    }

    pub fn disk_count(&self) -> usize {
        self.controllers().map(|entry| entry.children.len()).sum()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::device::{BusSharing, ControllerModel};
    use slog::{o, Discard};

    pub(crate) fn controller(key: ControllerKey, bus: u8) -> VirtualDevice {
        VirtualDevice {
            key,
            label: format!("SCSI controller {bus}"),
            controller_key: Some(100),
            unit_number: Some(3 + bus),
            kind: DeviceKind::ScsiController {
                model: ControllerModel::LsiLogic,
                bus_number: bus,
                sharing: BusSharing::NoSharing,
                scsi_unit_number: Some(7),
            },
        }
    }

    pub(crate) fn disk(
        key: DeviceKey,
        controller: ControllerKey,
        unit: UnitNumber,
    ) -> VirtualDevice {
        VirtualDevice {
            key,
            label: format!("Hard disk {key}"),
            controller_key: Some(controller),
            unit_number: Some(unit),
            kind: DeviceKind::Disk {
                backing: DatastorePath::new(
                    "ds1",
                    format!("vm/disk{key}.vmdk"),
                ),
                capacity_kb: 1024,
            },
        }
    }

    fn other(key: DeviceKey) -> VirtualDevice {
        VirtualDevice {
            key,
            label: "Video card".to_owned(),
            controller_key: Some(100),
            unit_number: Some(0),
            kind: DeviceKind::Other { description: "vga".to_owned() },
        }
    }

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    #[test]
    fn groups_disks_under_their_controllers() {
        let devices = vec![
            // A disk listed before its controller still lands on it.
            disk(2000, 1000, 0),
            controller(1000, 0),
            other(500),
            controller(1001, 1),
            disk(2001, 1000, 1),
            disk(2002, 1001, 0),
            // IDE disk: its controller is not a SCSI controller.
            disk(3000, 200, 0),
        ];

        let topology = ScsiTopology::build(&devices, &log());
        assert_eq!(topology.len(), 2);
        assert_eq!(topology.disk_count(), 3);

        let first = topology.get(1000).unwrap();
        assert_eq!(first.controller.bus_number, 0);
        let keys: Vec<_> = first.children.iter().map(|d| d.key).collect();
        assert_eq!(keys, vec![2000, 2001]);

        let keys: Vec<_> =
            topology.controllers().map(|e| e.controller.key).collect();
        assert_eq!(keys, vec![1000, 1001]);
        let missing = DatastorePath::new("ds1", "vm/disk3000.vmdk");
        assert!(topology.find_disk(&missing).is_none());
        assert_eq!(
            topology
                .find_disk(&DatastorePath::new("ds1", "vm/disk2002.vmdk"))
                .map(|d| d.key),
            Some(2002)
        );
    }

    #[test]
    fn free_unit_number_skips_controller_slot() {
        let mut devices = vec![controller(1000, 0)];
        for unit in 0..7 {
            devices.push(disk(2000 + i32::from(unit), 1000, unit));
        }
        let topology = ScsiTopology::build(&devices, &log());
        assert_eq!(topology.get(1000).unwrap().free_unit_number(), Some(8));
    }

    #[test]
    fn free_unit_number_fills_gaps_first() {
        let devices = vec![
            controller(1000, 0),
            disk(2000, 1000, 0),
            disk(2002, 1000, 2),
        ];
        let topology = ScsiTopology::build(&devices, &log());
        assert_eq!(topology.get(1000).unwrap().free_unit_number(), Some(1));
    }

    #[test]
    fn capacity_accounts_for_creatable_controllers() {
        let mut devices = vec![controller(1000, 0)];
        for unit in (0..16).filter(|u| *u != 7) {
            devices.push(disk(2000 + i32::from(unit), 1000, unit));
        }
        let topology = ScsiTopology::build(&devices, &log());
        let entry = topology.get(1000).unwrap();
        assert!(entry.is_full());
        assert_eq!(entry.free_unit_number(), None);
        assert!(topology.has_capacity());

        assert!(ScsiTopology::build(&[], &log()).has_capacity());
    }
}
