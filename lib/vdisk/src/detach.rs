// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Removing the disks recorded in a machine's attachment registry.

use slog::{info, o, warn, Logger};
use vdisk_types::DatastorePath;

use crate::error::Error;
use crate::provider::{ControlPlane, DeviceChange, MachineRef, ReconfigSpec};
use crate::registry::AttachmentRegistry;
use crate::task::OperationWaiter;

#[derive(Debug)]
pub enum DetachOutcome {
    Detached,
    /// No device on the machine is backed by the recorded path. The entry is
    /// dropped from the registry.
    Missing,
    /// Removing the device failed; the entry stays in the registry.
    Failed(Error),
}

#[derive(Debug, Default)]
pub struct DetachReport {
    pub disks: Vec<(DatastorePath, DetachOutcome)>,
}

impl DetachReport {
    pub fn detached(&self) -> impl Iterator<Item = &DatastorePath> {
        self.disks.iter().filter_map(|(path, outcome)| match outcome {
            DetachOutcome::Detached => Some(path),
            _ => None,
        })
    }

    pub fn first_error(&self) -> Option<&Error> {
        self.disks.iter().find_map(|(_, outcome)| match outcome {
            DetachOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }
}

pub struct Detacher<'a> {
    control_plane: &'a dyn ControlPlane,
    waiter: OperationWaiter,
    log: Logger,
}

impl<'a> Detacher<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        waiter: OperationWaiter,
        log: Logger,
    ) -> Self {
        Self { control_plane, waiter, log }
    }

    /// Detaches every disk in `vm`'s registry.
    ///
    /// Only a failure to read the registry is returned as an error. Each
    /// recorded disk is handled independently and its outcome reported.
    pub async fn detach_all(
        &self,
        vm: &MachineRef,
    ) -> Result<DetachReport, Error> {
        let mut registry =
            AttachmentRegistry::load(self.control_plane, vm, &self.log).await?;
        let mut report = DetachReport::default();
        let mut stale = false;

        for path in registry.paths().to_vec() {
            let log = self.log.new(o!("disk" => path.to_string()));
            let detached = self.detach_one(vm, &path, &registry, &log).await;
            let outcome = match detached {
                Ok(true) => {
                    registry.remove(&path);
                    DetachOutcome::Detached
                }
                Ok(false) => {
                    warn!(log, "attached disk was not found on machine");
                    registry.remove(&path);
                    stale = true;
                    DetachOutcome::Missing
                }
                Err(e) => {
                    warn!(log, "failed to detach disk"; "error" => %e);
                    DetachOutcome::Failed(e)
                }
            };
            report.disks.push((path, outcome));
        }

        if stale {
            if let Err(e) = self.write_registry(vm, &registry).await {
                warn!(self.log, "failed to prune stale registry entries";
                    "error" => %e,
                );
            }
        }

        Ok(report)
    }

    /// Removes the device backed by `path`, returning false if there is no
    /// such device. The registry written alongside the removal no longer
    /// lists `path`.
    async fn detach_one(
        &self,
        vm: &MachineRef,
        path: &DatastorePath,
        registry: &AttachmentRegistry,
        log: &Logger,
    ) -> Result<bool, Error> {
        let devices = self
            .control_plane
            .devices(vm)
            .await
            .map_err(Error::provider(format!("reading devices of {vm}")))?;
        let Some(device) =
            devices.iter().find(|dev| dev.disk_backing() == Some(path))
        else {
            return Ok(false);
        };

        let mut remaining = registry.clone();
        remaining.remove(path);

        info!(log, "detaching disk"; "device" => device.key);
        let spec = ReconfigSpec {
            device_changes: vec![DeviceChange::Remove(device.key)],
            annotations: vec![remaining.annotation()],
        };
        let context = format!("detaching disk {path}");
        let op = self
            .control_plane
            .reconfigure(vm, spec)
            .await
            .map_err(Error::provider(&context))?;
        self.waiter
            .wait(self.control_plane, &op, log)
            .await
            .map_err(Error::provider(&context))?;
        Ok(true)
    }

    async fn write_registry(
        &self,
        vm: &MachineRef,
        registry: &AttachmentRegistry,
    ) -> Result<(), Error> {
        let spec = ReconfigSpec {
            device_changes: Vec::new(),
            annotations: vec![registry.annotation()],
        };
        let context = "updating attachment registry";
        let op = self
            .control_plane
            .reconfigure(vm, spec)
            .await
            .map_err(Error::provider(context))?;
        self.waiter
            .wait(self.control_plane, &op, &self.log)
            .await
            .map_err(Error::provider(context))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::{MockControlPlane, OperationHandle, OperationStatus};
    use crate::registry::ATTACHED_DISKS_KEY;
    use crate::topology::test::{controller, disk};
    use slog::Discard;
    use std::time::Duration;

    #[tokio::test]
    async fn failed_removal_keeps_entry_and_continues() {
        let mut cp = MockControlPlane::new();
        cp.expect_annotation()
            .withf(|_, key| key == ATTACHED_DISKS_KEY)
            .returning(|_, _| {
                Ok(Some(
                    "[ds1] vm/disk2000.vmdk,[ds1] vm/disk2001.vmdk".to_owned(),
                ))
            });
        cp.expect_devices().returning(|_| {
            Ok(vec![
                controller(1000, 0),
                disk(2000, 1000, 0),
                disk(2001, 1000, 1),
            ])
        });
        cp.expect_reconfigure().times(2).returning(|_, spec| {
            match &spec.device_changes[..] {
                [DeviceChange::Remove(2000)] => Ok(OperationHandle(1)),
                [DeviceChange::Remove(2001)] => {
                    // The first removal failed, so its entry is still there.
                    assert_eq!(
                        spec.annotations[0].value,
                        "[ds1] vm/disk2000.vmdk"
                    );
                    Ok(OperationHandle(2))
                }
                other => panic!("unexpected changes {other:?}"),
            }
        });
        cp.expect_operation_status().returning(|op| match op {
            OperationHandle(1) => {
                Ok(OperationStatus::Error("device busy".to_owned()))
            }
            _ => Ok(OperationStatus::Success),
        });

        let detacher = Detacher::new(
            &cp,
            OperationWaiter::new(
                Duration::from_millis(1),
                Duration::from_millis(1),
            ),
            Logger::root(Discard, o!()),
        );
        let report = detacher.detach_all(&MachineRef::new("vm")).await.unwrap();

        assert_eq!(report.disks.len(), 2);
        assert!(matches!(report.disks[0].1, DetachOutcome::Failed(_)));
        assert!(matches!(report.disks[1].1, DetachOutcome::Detached));
        assert!(report.first_error().is_some());
    }

    #[tokio::test]
    async fn empty_registry_does_nothing() {
        let mut cp = MockControlPlane::new();
        cp.expect_annotation().returning(|_, _| Ok(None));
        let detacher = Detacher::new(
            &cp,
            OperationWaiter::default(),
            Logger::root(Discard, o!()),
        );
        let report = detacher.detach_all(&MachineRef::new("vm")).await.unwrap();
        assert!(report.disks.is_empty());
    }
}
