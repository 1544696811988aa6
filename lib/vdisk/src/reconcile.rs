// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing a machine's disks in line with a declared disk list.
//!
//! Disks are handled strictly one at a time. Each attach changes the
//! machine's device list, and the next disk's controller and unit number
//! must be chosen from the state after that change, so the topology is
//! re-read for every disk.

use slog::{error, info, o, Logger};
use vdisk_types::{
    ControllerKey, DatastorePath, DiskPath, DiskSpec, UnitNumber,
};

use crate::alloc::ControllerAllocator;
use crate::attachment::{AttachmentChecker, AttachmentState};
use crate::datastore::{ensure_folder, DiskCreator, DiskLocator};
use crate::device::VirtualDevice;
use crate::error::{ConfigProblem, Error};
use crate::provider::{ControlPlane, DeviceChange, MachineRef, ReconfigSpec};
use crate::registry::AttachmentRegistry;
use crate::task::OperationWaiter;
use crate::topology::ScsiTopology;
use crate::validate::{size_kb, validate, DesiredDisk};

/// The machine being reconciled and the datastore its disks live on by
/// default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub machine: MachineRef,
    pub datacenter: String,
    pub datastore: String,
}

/// What happened to one disk entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskOutcome {
    /// The disk was attached by this run.
    Attached {
        path: DatastorePath,
        controller: ControllerKey,
        unit_number: UnitNumber,
        /// Whether the backing file was created by this run.
        created: bool,
    },
    /// The disk was already attached to the machine; nothing was changed.
    AlreadyAttached { path: DatastorePath },
}

#[derive(Debug)]
pub struct DiskReport {
    /// Position of the entry in the submitted list.
    pub index: usize,
    pub result: Result<DiskOutcome, Error>,
}

/// Per-disk results of one reconciliation. A failed disk does not undo the
/// disks before it.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub disks: Vec<DiskReport>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.disks.iter().all(|d| d.result.is_ok())
    }

    pub fn first_error(&self) -> Option<&Error> {
        self.disks.iter().find_map(|d| d.result.as_ref().err())
    }

    pub fn attached(&self) -> impl Iterator<Item = &DiskOutcome> {
        self.disks.iter().filter_map(|d| match &d.result {
            Ok(outcome @ DiskOutcome::Attached { .. }) => Some(outcome),
            _ => None,
        })
    }
}

pub struct Reconciler<'a> {
    control_plane: &'a dyn ControlPlane,
    waiter: OperationWaiter,
    log: Logger,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        waiter: OperationWaiter,
        log: Logger,
    ) -> Self {
        Self { control_plane, waiter, log }
    }

    /// Validates `disks` and then reconciles each one in order.
    ///
    /// Returns an error only if validation fails, in which case nothing has
    /// been changed. Failures of individual disks are in the report.
    pub async fn reconcile(
        &self,
        target: &Target,
        disks: &[DiskSpec],
    ) -> Result<ReconcileReport, Error> {
        let desired = validate(disks)?;

        let mut report = ReconcileReport::default();
        for (index, disk) in desired.iter().enumerate() {
            let result = self.reconcile_disk(target, index, disk).await;
            if let Err(e) = &result {
                let kind: &'static str = e.kind().into();
                error!(self.log, "failed to reconcile disk";
                    "index" => index,
                    "kind" => kind,
                    "error" => %e,
                );
            }
            report.disks.push(DiskReport { index, result });
        }

        Ok(report)
    }

    /// Brings a single validated disk entry into place. `index` is the
    /// entry's position in its list, used to derive a path when none was
    /// given.
    pub async fn reconcile_disk(
        &self,
        target: &Target,
        index: usize,
        disk: &DesiredDisk,
    ) -> Result<DiskOutcome, Error> {
        let vm = &target.machine;
        let datastore = disk.datastore().unwrap_or(&target.datastore);
        let path = match disk {
            DesiredDisk::Create { path: Some(path), .. }
            | DesiredDisk::Attach { path, .. } => path.parse::<DiskPath>()?,
            DesiredDisk::Create { path: None, .. } => derived_path(vm, index)?,
        };
        let full_path = DatastorePath::new(datastore, path.to_string());
        let log = self.log.new(o!("disk" => full_path.to_string()));

        // Everything up to the capacity check is read-only, so a disk that
        // needs nothing, or cannot be placed, causes no mutation.
        let existing = DiskLocator::new(self.control_plane)
            .find_path(datastore, &path)
            .await?;

        if let Some(record) = &existing {
            match AttachmentChecker::new(self.control_plane, &log)
                .check(&record.path, vm)
                .await?
            {
                AttachmentState::ThisMachine => {
                    info!(log, "disk already attached");
                    return Ok(DiskOutcome::AlreadyAttached {
                        path: record.path.clone(),
                    });
                }
                AttachmentState::OtherMachine(machine) => {
                    return Err(Error::AttachedElsewhere {
                        path: record.path.clone(),
                        machine,
                    });
                }
                AttachmentState::None => {}
            }
        }

        let (capacity_kb, create) = match (disk, &existing) {
            (DesiredDisk::Attach { .. }, None) => {
                return Err(Error::NotFound(full_path));
            }
            (_, Some(record)) => {
                if let DesiredDisk::Create { .. } = disk {
                    info!(log, "virtual disk already created, using it");
                }
                (record.capacity_kb, None)
            }
            (DesiredDisk::Create { size, disk_type, .. }, None) => {
                let capacity_kb = size_kb(*size).ok_or_else(|| {
                    Error::Config(vec![ConfigProblem {
                        index,
                        reason: format!("'size' {size} is too large"),
                    }])
                })?;
                (capacity_kb, Some(*disk_type))
            }
        };

        if !self.topology(vm).await?.has_capacity() {
            return Err(Error::ResourceExhausted(vm.clone()));
        }

        ensure_folder(
            self.control_plane,
            &target.datacenter,
            datastore,
            &path,
            &log,
        )
        .await?;

        let backing = match create {
            Some(disk_type) => {
                DiskCreator::new(self.control_plane, &self.waiter, &log)
                    .ensure(
                        datastore,
                        &path,
                        capacity_kb,
                        disk_type,
                        &target.datacenter,
                    )
                    .await?
            }
            None => existing.map_or(full_path, |record| record.path),
        };

        let topology = self.topology(vm).await?;
        let controller = ControllerAllocator::new(
            self.control_plane,
            &self.waiter,
            &log,
        )
        .allocate(vm, &topology)
        .await?;
        let controller_key = controller.controller.key;
        let unit_number = controller
            .free_unit_number()
            .ok_or_else(|| Error::ResourceExhausted(vm.clone()))?;

        let mut registry =
            AttachmentRegistry::load(self.control_plane, vm, &log).await?;
        registry.insert(backing.clone());

        info!(log, "attaching disk";
            "controller" => controller_key,
            "unit" => unit_number,
            "capacity_kb" => capacity_kb,
        );
        let spec = ReconfigSpec {
            device_changes: vec![DeviceChange::Add(VirtualDevice::new_disk(
                backing.clone(),
                capacity_kb,
                controller_key,
                unit_number,
            ))],
            annotations: vec![registry.annotation()],
        };
        let context = format!("attaching disk {backing}");
        let op = self
            .control_plane
            .reconfigure(vm, spec)
            .await
            .map_err(Error::provider(&context))?;
        self.waiter
            .wait(self.control_plane, &op, &log)
            .await
            .map_err(Error::provider(&context))?;

        Ok(DiskOutcome::Attached {
            path: backing,
            controller: controller_key,
            unit_number,
            created: create.is_some(),
        })
    }

    async fn topology(&self, vm: &MachineRef) -> Result<ScsiTopology, Error> {
        let devices = self
            .control_plane
            .devices(vm)
            .await
            .map_err(Error::provider(format!("reading devices of {vm}")))?;
        Ok(ScsiTopology::build(&devices, &self.log))
    }
}

/// Path used for a disk to be created when the entry names none: the
/// machine's folder, numbered by the entry's 1-based position.
fn derived_path(vm: &MachineRef, index: usize) -> Result<DiskPath, Error> {
    let name = vm.name();
    Ok(format!("{name}/{name}_{}.vmdk", index + 1).parse()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::{
        DatastoreFile, FileLayout, MockControlPlane, OperationHandle,
        OperationStatus,
    };
    use crate::topology::test::controller;
    use slog::Discard;
    use std::time::Duration;
    use vdisk_types::DiskType;

    fn target() -> Target {
        Target {
            machine: MachineRef::new("vmA"),
            datacenter: "dc1".to_owned(),
            datastore: "ds1".to_owned(),
        }
    }

    fn waiter() -> OperationWaiter {
        OperationWaiter::new(Duration::from_millis(1), Duration::from_millis(1))
    }

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    #[test]
    fn derived_paths_follow_entry_position() {
        let path = derived_path(&MachineRef::new("vmA"), 0).unwrap();
        assert_eq!(path.to_string(), "vmA/vmA_1.vmdk");
    }

    #[tokio::test]
    async fn invalid_list_touches_nothing() {
        // Any call on the mock would panic.
        let cp = MockControlPlane::new();
        let reconciler = Reconciler::new(&cp, waiter(), log());
        let err = reconciler
            .reconcile(
                &target(),
                &[
                    DiskSpec {
                        create: Some(false),
                        path: Some("a/b.vmdk".to_owned()),
                        ..Default::default()
                    },
                    DiskSpec::default(),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref p) if p.len() == 1));
    }

    #[tokio::test]
    async fn malformed_path_fails_before_any_call() {
        let cp = MockControlPlane::new();
        let reconciler = Reconciler::new(&cp, waiter(), log());
        let disk = DesiredDisk::Attach {
            path: "justafile.vmdk".to_owned(),
            datastore: None,
        };
        let err = reconciler.reconcile_disk(&target(), 0, &disk).await;
        assert!(matches!(err, Err(Error::PathFormat(_))));
    }

    #[tokio::test]
    async fn oversized_disk_is_refused_without_changes() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists().returning(|_| Ok(false));
        let reconciler = Reconciler::new(&cp, waiter(), log());
        let disk = DesiredDisk::Create {
            path: Some("vmA/big.vmdk".to_owned()),
            size: u64::MAX / 512,
            disk_type: DiskType::Thin,
            datastore: None,
        };
        let err = reconciler
            .reconcile_disk(&target(), 3, &disk)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ref p) if p.len() == 1 && p[0].index == 3
        ));
    }

    #[tokio::test]
    async fn attach_failure_is_reported_for_that_disk() {
        let mut cp = MockControlPlane::new();
        cp.expect_path_exists().returning(|_| Ok(true));
        cp.expect_search_datastore().returning(|folder, name| {
            Ok(vec![DatastoreFile {
                path: DatastorePath::new(
                    folder.datastore(),
                    format!("{}/{name}", folder.path()),
                ),
                capacity_kb: 4096,
            }])
        });
        cp.expect_machines_using_datastore()
            .returning(|_| Ok(vec![MachineRef::new("vmA")]));
        cp.expect_collect_file_layouts().returning(|_| {
            Ok(vec![FileLayout {
                machine: MachineRef::new("vmA"),
                files: vec!["[ds1] vmA/vmA.vmx".to_owned()],
            }])
        });
        cp.expect_devices().returning(|_| Ok(vec![controller(1000, 0)]));
        cp.expect_annotation().returning(|_, _| Ok(None));
        cp.expect_reconfigure().times(2).returning(|_, spec| {
            assert_eq!(spec.annotations.len(), 1);
            match &spec.device_changes[..] {
                [DeviceChange::Add(dev)] => {
                    assert_eq!(dev.controller_key, Some(1000));
                    assert_eq!(dev.unit_number, Some(0));
                }
                other => panic!("unexpected changes {other:?}"),
            }
            Ok(OperationHandle(1))
        });
        cp.expect_operation_status().returning(|_| {
            Ok(OperationStatus::Error("unit number in use".to_owned()))
        });

        let reconciler = Reconciler::new(&cp, waiter(), log());
        let disks = [
            DiskSpec {
                create: Some(false),
                path: Some("shared/a.vmdk".to_owned()),
                ..Default::default()
            },
            DiskSpec {
                create: Some(false),
                path: Some("shared/b.vmdk".to_owned()),
                ..Default::default()
            },
        ];
        let report = reconciler.reconcile(&target(), &disks).await.unwrap();

        // Both disks were attempted even though the first failed.
        assert_eq!(report.disks.len(), 2);
        assert!(!report.is_success());
        for disk in &report.disks {
            assert!(matches!(
                disk.result,
                Err(Error::ProviderFault { ref context, .. })
                    if context.starts_with("attaching disk")
            ));
        }
    }
}
