// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choosing where on a machine's SCSI buses a new disk goes.

use slog::{info, Logger};
use vdisk_types::{ControllerKey, UnitNumber, MAX_SCSI_CONTROLLERS};

use crate::device::VirtualDevice;
use crate::error::Error;
use crate::provider::{
    ControlPlane, DeviceChange, MachineRef, OperationHandle, ProviderError,
    ReconfigSpec,
};
use crate::task::OperationWaiter;
use crate::topology::{ControllerEntry, ScsiTopology};

/// Key given to the first SCSI controller created on a machine that has none.
pub const FIRST_CONTROLLER_KEY: ControllerKey = 1000;

/// Number of SCSI buses a machine exposes.
const SCSI_BUS_COUNT: u8 = MAX_SCSI_CONTROLLERS as u8;

/// What to ask the control plane for when creating a controller, and how to
/// recognize the result afterwards. The control plane only settles the
/// controller's key once the reconfiguration completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelationHint {
    pub key: ControllerKey,
    pub bus_number: u8,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ControllerPlan<'a> {
    /// An existing controller has room.
    Use(&'a ControllerEntry),
    /// Every existing controller is full but another one can be added.
    Create(CorrelationHint),
    /// The machine has the maximum number of controllers and all are full.
    Exhausted,
}

/// Decides which controller a new disk should go on.
///
/// Controllers are considered in ascending key order and the first with room
/// wins. A new controller takes the next key and the next bus number after
/// the highest existing ones.
pub fn plan_controller(topology: &ScsiTopology) -> ControllerPlan<'_> {
    if let Some(entry) = topology.controllers().find(|entry| !entry.is_full())
    {
        return ControllerPlan::Use(entry);
    }

    if topology.len() >= MAX_SCSI_CONTROLLERS {
        return ControllerPlan::Exhausted;
    }

    let max_key = topology.controllers().map(|e| e.controller.key).max();
    let buses: Vec<u8> =
        topology.controllers().map(|e| e.controller.bus_number).collect();
    let next_bus = match buses.iter().max() {
        None => Some(0),
        Some(max) => max.checked_add(1).filter(|bus| *bus < SCSI_BUS_COUNT),
    };
    // Bus numbers are bounded, so past the end fill the lowest gap.
    let bus_number = next_bus.unwrap_or_else(|| {
        (0..SCSI_BUS_COUNT)
            .find(|bus| !buses.contains(bus))
            .unwrap_or(SCSI_BUS_COUNT)
    });

    ControllerPlan::Create(CorrelationHint {
        key: max_key.map_or(FIRST_CONTROLLER_KEY, |key| key + 1),
        bus_number,
    })
}

/// Picks the lowest unit number that is free on `controller`.
pub fn allocate_unit_number(
    topology: &ScsiTopology,
    controller: ControllerKey,
) -> Option<UnitNumber> {
    topology.get(controller)?.free_unit_number()
}

/// Finds a controller with spare capacity, creating one if needed.
pub struct ControllerAllocator<'a> {
    control_plane: &'a dyn ControlPlane,
    waiter: &'a OperationWaiter,
    log: &'a Logger,
}

impl<'a> ControllerAllocator<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        waiter: &'a OperationWaiter,
        log: &'a Logger,
    ) -> Self {
        Self { control_plane, waiter, log }
    }

    /// Returns a controller with room for one more disk, as seen in a
    /// topology that is current after any controller creation.
    pub async fn allocate(
        &self,
        vm: &MachineRef,
        topology: &ScsiTopology,
    ) -> Result<ControllerEntry, Error> {
        match plan_controller(topology) {
            ControllerPlan::Use(entry) => Ok(entry.clone()),
            ControllerPlan::Exhausted => {
                Err(Error::ResourceExhausted(vm.clone()))
            }
            ControllerPlan::Create(hint) => {
                info!(self.log, "no SCSI controller has room, creating one";
                    "key" => hint.key,
                    "bus" => hint.bus_number,
                );
                let op = self.submit(vm, hint).await?;
                self.waiter
                    .wait(self.control_plane, &op, self.log)
                    .await
                    .map_err(Error::provider(format!(
                        "creating SCSI controller on bus {}",
                        hint.bus_number
                    )))?;
                self.resolve(vm, hint).await
            }
        }
    }

    /// Submits the request to add a controller.
    pub async fn submit(
        &self,
        vm: &MachineRef,
        hint: CorrelationHint,
    ) -> Result<OperationHandle, Error> {
        let spec = ReconfigSpec {
            device_changes: vec![DeviceChange::Add(
                VirtualDevice::new_scsi_controller(hint.key, hint.bus_number),
            )],
            annotations: Vec::new(),
        };
        self.control_plane
            .reconfigure(vm, spec)
            .await
            .map_err(Error::provider("submitting SCSI controller creation"))
    }

    /// Re-reads the device list and finds the controller created for `hint`,
    /// matching on the provisional key first and the bus number second.
    pub async fn resolve(
        &self,
        vm: &MachineRef,
        hint: CorrelationHint,
    ) -> Result<ControllerEntry, Error> {
        let devices = self
            .control_plane
            .devices(vm)
            .await
            .map_err(Error::provider("reading devices"))?;
        let topology = ScsiTopology::build(&devices, self.log);

        topology
            .get(hint.key)
            .or_else(|| {
                topology
                    .controllers()
                    .find(|e| e.controller.bus_number == hint.bus_number)
            })
            .cloned()
            .ok_or_else(|| Error::ProviderFault {
                context: "locating newly created SCSI controller".to_owned(),
                source: ProviderError::Fault(format!(
                    "no controller with key {} or bus {} on {}",
                    hint.key, hint.bus_number, vm
                )),
            })
    }
}
