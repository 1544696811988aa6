// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciling the SCSI disks of a virtual machine against a declared list.
//!
//! Given a machine and a list of disks it should have, a [`Reconciler`]
//! locates or creates each backing file on its datastore, refuses to attach
//! a file that another machine is using, picks a SCSI controller and unit
//! number (adding a controller when every existing one is full), and attaches
//! the disk. A [`Detacher`] later removes exactly the disks recorded as
//! attached this way.
//!
//! All access to the virtualization control plane goes through the
//! [`ControlPlane`] trait. [`sim::SimControlPlane`] implements it in memory.

pub mod alloc;
pub mod attachment;
pub mod datastore;
pub mod detach;
pub mod device;
pub mod error;
pub mod provider;
pub mod reconcile;
pub mod registry;
pub mod sim;
pub mod task;
pub mod topology;
pub mod validate;

pub use detach::{DetachOutcome, DetachReport, Detacher};
pub use error::{Error, ErrorKind};
pub use provider::{ControlPlane, MachineRef};
pub use reconcile::{DiskOutcome, ReconcileReport, Reconciler, Target};
pub use task::OperationWaiter;
pub use vdisk_types as types;
