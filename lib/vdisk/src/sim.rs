// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory control plane.
//!
//! [`SimControlPlane`] keeps a datacenter's datastores and machines in
//! memory and enforces the same limits a real control plane would (four SCSI
//! controllers, fifteen disks per controller, unique unit numbers, existing
//! backing files). Mutations are applied when submitted; the operation handle
//! they return reports `Running` for a configurable number of polls before
//! settling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog::{debug, info, Logger};
use vdisk_types::{
    DatastorePath, DeviceKey, MAX_SCSI_CONTROLLERS, MAX_UNIT_NUMBER,
    SCSI_DISKS_PER_CONTROLLER,
};

use crate::device::{BusSharing, ControllerModel, DeviceKind, VirtualDevice};
use crate::provider::{
    BackingProvisioning, ControlPlane, DatastoreFile, DeviceChange,
    FileLayout, MachineRef, OperationHandle, OperationStatus, ProviderError,
    ReconfigSpec, VirtualDiskSpec,
};

/// Key of the PCI bus every simulated machine's controllers hang off.
const PCI_CONTROLLER_KEY: DeviceKey = 100;
const IDE_CONTROLLER_KEY: DeviceKey = 200;
const FIRST_SCSI_KEY: DeviceKey = 1000;
const FIRST_DISK_KEY: DeviceKey = 2000;

/// The unit number a SCSI controller occupies on its own bus.
const SCSI_CONTROLLER_UNIT: u8 = 7;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFile {
    pub capacity_kb: u64,
    pub provisioning: BackingProvisioning,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDatastore {
    #[serde(default)]
    pub directories: BTreeSet<String>,

    #[serde(default)]
    pub files: BTreeMap<String, SimFile>,
}

impl SimDatastore {
    fn exists(&self, path: &str) -> bool {
        path.is_empty()
            || self.directories.contains(path)
            || self.files.contains_key(path)
    }

    /// Creates `dir` and all of its ancestors.
    fn create_dir_all(&mut self, dir: &str) {
        let mut prefix = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            self.directories.insert(prefix.clone());
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimMachine {
    /// The machine's own configuration file, which places it on a datastore
    /// even before it has any disks.
    #[serde(default)]
    pub config_file: Option<DatastorePath>,

    #[serde(default)]
    pub devices: Vec<VirtualDevice>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl SimMachine {
    fn layout(&self) -> Vec<String> {
        self.config_file
            .iter()
            .chain(self.devices.iter().filter_map(VirtualDevice::disk_backing))
            .map(ToString::to_string)
            .collect()
    }

    fn scsi_controllers(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter().filter(|dev| {
            matches!(dev.kind, DeviceKind::ScsiController { .. })
        })
    }

    fn next_key(&self, floor: DeviceKey) -> DeviceKey {
        self.devices
            .iter()
            .map(|dev| dev.key + 1)
            .filter(|key| *key >= floor)
            .max()
            .unwrap_or(floor)
    }
}

/// Everything the simulated control plane knows about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub datacenter: String,

    #[serde(default)]
    pub datastores: BTreeMap<String, SimDatastore>,

    #[serde(default)]
    pub machines: BTreeMap<String, SimMachine>,
}

impl Inventory {
    pub fn new(datacenter: impl Into<String>) -> Self {
        Self { datacenter: datacenter.into(), ..Default::default() }
    }

    /// A small datacenter with two datastores and two machines, the second
    /// of which has a disk attached.
    pub fn example() -> Self {
        let mut inventory = Self::new("dc1");
        inventory.add_datastore("ds1").add_datastore("ds2");
        inventory.add_machine("vmA", "ds1").add_machine("vmB", "ds1");
        let shared = DatastorePath::new("ds2", "shared/data.vmdk");
        inventory.add_file(&shared, 10 * 1024);
        inventory.attach("vmB", shared, FIRST_SCSI_KEY, 0);
        inventory
    }

    pub fn add_datastore(&mut self, name: &str) -> &mut Self {
        self.datastores.entry(name.to_owned()).or_default();
        self
    }

    /// Adds a powered-off machine homed on `datastore` with one empty SCSI
    /// controller. The datastore is created if needed.
    pub fn add_machine(&mut self, name: &str, datastore: &str) -> &mut Self {
        self.add_datastore(datastore);
        if let Some(ds) = self.datastores.get_mut(datastore) {
            ds.create_dir_all(name);
        }

        let other = |key, label: &str| VirtualDevice {
            key,
            label: label.to_owned(),
            controller_key: None,
            unit_number: None,
            kind: DeviceKind::Other { description: label.to_owned() },
        };
        let devices = vec![
            other(PCI_CONTROLLER_KEY, "PCI controller 0"),
            other(IDE_CONTROLLER_KEY, "IDE 0"),
            other(500, "Video card"),
            VirtualDevice {
                key: FIRST_SCSI_KEY,
                label: "SCSI controller 0".to_owned(),
                controller_key: Some(PCI_CONTROLLER_KEY),
                unit_number: Some(3),
                kind: DeviceKind::ScsiController {
                    model: ControllerModel::LsiLogic,
                    bus_number: 0,
                    sharing: BusSharing::NoSharing,
                    scsi_unit_number: Some(SCSI_CONTROLLER_UNIT),
                },
            },
        ];

        self.machines.insert(
            name.to_owned(),
            SimMachine {
                config_file: Some(DatastorePath::new(
                    datastore,
                    format!("{name}/{name}.vmx"),
                )),
                devices,
                annotations: BTreeMap::new(),
            },
        );
        self
    }

    /// Places a file, creating the datastore and parent directories.
    pub fn add_file(&mut self, path: &DatastorePath, capacity_kb: u64) {
        let ds =
            self.datastores.entry(path.datastore().to_owned()).or_default();
        if let Some((parent, _)) = path.path().rsplit_once('/') {
            ds.create_dir_all(parent);
        }
        ds.files.insert(
            path.path().to_owned(),
            SimFile { capacity_kb, provisioning: BackingProvisioning::Thin },
        );
    }

    /// Attaches an existing file to a machine directly, the way an operator
    /// outside of this tool might. Does nothing if the machine is unknown.
    pub fn attach(
        &mut self,
        machine: &str,
        backing: DatastorePath,
        controller: DeviceKey,
        unit_number: u8,
    ) {
        let capacity_kb = self
            .datastores
            .get(backing.datastore())
            .and_then(|ds| ds.files.get(backing.path()))
            .map_or(0, |file| file.capacity_kb);
        if let Some(vm) = self.machines.get_mut(machine) {
            let key = vm.next_key(FIRST_DISK_KEY);
            let mut disk = VirtualDevice::new_disk(
                backing,
                capacity_kb,
                controller,
                unit_number,
            );
            disk.key = key;
            disk.label = format!("Hard disk {}", key - FIRST_DISK_KEY + 1);
            vm.devices.push(disk);
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn machine_mut(
        &mut self,
        vm: &MachineRef,
    ) -> Result<&mut SimMachine, ProviderError> {
        self.machines
            .get_mut(vm.name())
            .ok_or_else(|| ProviderError::MachineNotFound(vm.clone()))
    }

    fn datastore(&self, name: &str) -> Result<&SimDatastore, ProviderError> {
        self.datastores
            .get(name)
            .ok_or_else(|| ProviderError::DatastoreNotFound(name.to_owned()))
    }

    fn datastore_mut(
        &mut self,
        name: &str,
    ) -> Result<&mut SimDatastore, ProviderError> {
        self.datastores
            .get_mut(name)
            .ok_or_else(|| ProviderError::DatastoreNotFound(name.to_owned()))
    }

    fn file_exists(&self, path: &DatastorePath) -> bool {
        self.datastores
            .get(path.datastore())
            .is_some_and(|ds| ds.files.contains_key(path.path()))
    }

    /// Applies `spec` to the machine as a unit: either every change is made
    /// or none is.
    fn reconfigure(
        &mut self,
        vm: &MachineRef,
        spec: &ReconfigSpec,
    ) -> Result<Result<(), String>, ProviderError> {
        let mut machine = self.machine_mut(vm)?.clone();
        for change in &spec.device_changes {
            let applied = match change {
                DeviceChange::Add(device) => {
                    self.add_device(&mut machine, device)
                }
                DeviceChange::Remove(key) => {
                    let before = machine.devices.len();
                    machine.devices.retain(|dev| dev.key != *key);
                    if machine.devices.len() == before {
                        Err(format!("device {key} does not exist"))
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(message) = applied {
                return Ok(Err(message));
            }
        }

        for annotation in &spec.annotations {
            if annotation.value.is_empty() {
                machine.annotations.remove(&annotation.key);
            } else {
                machine
                    .annotations
                    .insert(annotation.key.clone(), annotation.value.clone());
            }
        }

        *self.machine_mut(vm)? = machine;
        Ok(Ok(()))
    }

    fn add_device(
        &self,
        machine: &mut SimMachine,
        device: &VirtualDevice,
    ) -> Result<(), String> {
        let mut device = device.clone();
        match device.kind {
            DeviceKind::ScsiController { bus_number, .. } => {
                check_controller_slot(machine, bus_number)?;
                if let DeviceKind::ScsiController { scsi_unit_number, .. } =
                    &mut device.kind
                {
                    scsi_unit_number.get_or_insert(SCSI_CONTROLLER_UNIT);
                }
                device.label = format!("SCSI controller {bus_number}");
                device.controller_key.get_or_insert(PCI_CONTROLLER_KEY);
                if device.key <= 0
                    || machine.devices.iter().any(|dev| dev.key == device.key)
                {
                    device.key = machine.next_key(FIRST_SCSI_KEY);
                }
            }
            DeviceKind::Disk { ref backing, .. } => {
                if !self.file_exists(backing) {
                    return Err(format!("file {backing} was not found"));
                }
                check_disk_slot(
                    machine,
                    device.controller_key,
                    device.unit_number,
                )?;
                if device.key <= 0
                    || machine.devices.iter().any(|dev| dev.key == device.key)
                {
                    device.key = machine.next_key(FIRST_DISK_KEY);
                }
                device.label =
                    format!("Hard disk {}", device.key - FIRST_DISK_KEY + 1);
            }
            DeviceKind::Other { .. } => {
                if device.key <= 0 {
                    device.key = machine.next_key(FIRST_DISK_KEY);
                }
            }
        }

        machine.devices.push(device);
        Ok(())
    }
}

fn check_controller_slot(
    machine: &SimMachine,
    bus_number: u8,
) -> Result<(), String> {
    if machine.scsi_controllers().count() >= MAX_SCSI_CONTROLLERS {
        return Err(format!(
            "machine already has {MAX_SCSI_CONTROLLERS} SCSI controllers"
        ));
    }
    if usize::from(bus_number) >= MAX_SCSI_CONTROLLERS {
        return Err(format!("invalid SCSI bus number {bus_number}"));
    }
    let bus_taken = machine.scsi_controllers().any(|dev| {
        matches!(
            dev.kind,
            DeviceKind::ScsiController { bus_number: b, .. } if b == bus_number
        )
    });
    if bus_taken {
        return Err(format!("SCSI bus {bus_number} is in use"));
    }
    Ok(())
}

fn check_disk_slot(
    machine: &SimMachine,
    controller_key: Option<DeviceKey>,
    unit_number: Option<u8>,
) -> Result<(), String> {
    let controller_key =
        controller_key.ok_or_else(|| "disk has no controller".to_owned())?;
    let controller_unit = machine
        .scsi_controllers()
        .find(|dev| dev.key == controller_key)
        .map(|dev| match dev.kind {
            DeviceKind::ScsiController { scsi_unit_number, .. } => {
                scsi_unit_number
            }
            _ => None,
        })
        .ok_or_else(|| {
            format!("no SCSI controller with key {controller_key}")
        })?;
    let unit =
        unit_number.ok_or_else(|| "disk has no unit number".to_owned())?;
    if unit > MAX_UNIT_NUMBER {
        return Err(format!("invalid unit number {unit}"));
    }

    let siblings: Vec<&VirtualDevice> = machine
        .devices
        .iter()
        .filter(|dev| dev.controller_key == Some(controller_key))
        .collect();
    if siblings.len() >= SCSI_DISKS_PER_CONTROLLER {
        return Err(format!("controller {controller_key} has no free slots"));
    }
    if controller_unit == Some(unit)
        || siblings.iter().any(|dev| dev.unit_number == Some(unit))
    {
        return Err(format!(
            "unit number {unit} on controller {controller_key} is in use"
        ));
    }
    Ok(())
}

/// Which kind of call an injected fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    Reconfigure,
    CreateDisk,
    MakeDirectory,
    Search,
}

struct SimOperation {
    remaining_polls: u32,
    outcome: Result<(), String>,
}

struct SimState {
    inventory: Inventory,
    operations: BTreeMap<u64, SimOperation>,
    next_op: u64,
    polls_before_completion: u32,
    faults: Vec<FaultPoint>,
    mutations: usize,
}

impl SimState {
    fn take_fault(&mut self, point: FaultPoint) -> bool {
        match self.faults.iter().position(|f| *f == point) {
            Some(idx) => {
                self.faults.remove(idx);
                true
            }
            None => false,
        }
    }

    fn start_operation(
        &mut self,
        outcome: Result<(), String>,
    ) -> OperationHandle {
        self.next_op += 1;
        self.operations.insert(
            self.next_op,
            SimOperation {
                remaining_polls: self.polls_before_completion,
                outcome,
            },
        );
        OperationHandle(self.next_op)
    }

    fn check_datacenter(&self, datacenter: &str) -> Result<(), ProviderError> {
        if datacenter == self.inventory.datacenter {
            Ok(())
        } else {
            Err(ProviderError::Fault(format!(
                "datacenter {datacenter} not found"
            )))
        }
    }
}

pub struct SimControlPlane {
    state: Mutex<SimState>,
    log: Logger,
}

impl SimControlPlane {
    pub fn new(inventory: Inventory, log: Logger) -> Self {
        Self {
            state: Mutex::new(SimState {
                inventory,
                operations: BTreeMap::new(),
                next_op: 0,
                polls_before_completion: 0,
                faults: Vec::new(),
                mutations: 0,
            }),
            log,
        }
    }

    /// Makes every subsequently submitted operation report `Running` for
    /// `polls` status queries before settling.
    pub fn with_polls_before_completion(self, polls: u32) -> Self {
        self.state.lock().unwrap().polls_before_completion = polls;
        self
    }

    /// Makes the next call of the given kind fail.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.state.lock().unwrap().faults.push(point);
    }

    /// Number of mutating calls made so far, successful or not.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    pub fn inventory(&self) -> Inventory {
        self.state.lock().unwrap().inventory.clone()
    }

    pub fn into_inventory(self) -> Inventory {
        self.state.into_inner().unwrap().inventory
    }
}

#[async_trait]
impl ControlPlane for SimControlPlane {
    async fn devices(
        &self,
        vm: &MachineRef,
    ) -> Result<Vec<VirtualDevice>, ProviderError> {
        let state = self.state.lock().unwrap();
        state
            .inventory
            .machines
            .get(vm.name())
            .map(|m| m.devices.clone())
            .ok_or_else(|| ProviderError::MachineNotFound(vm.clone()))
    }

    async fn reconfigure(
        &self,
        vm: &MachineRef,
        spec: ReconfigSpec,
    ) -> Result<OperationHandle, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let outcome = if state.take_fault(FaultPoint::Reconfigure) {
            Err("injected reconfiguration fault".to_owned())
        } else {
            state.inventory.reconfigure(vm, &spec)?
        };
        let op = state.start_operation(outcome);
        debug!(self.log, "reconfigure submitted"; "vm" => %vm, "op" => %op);
        Ok(op)
    }

    async fn operation_status(
        &self,
        op: &OperationHandle,
    ) -> Result<OperationStatus, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let operation = state
            .operations
            .get_mut(&op.0)
            .ok_or_else(|| ProviderError::UnknownOperation(op.clone()))?;
        if operation.remaining_polls > 0 {
            operation.remaining_polls -= 1;
            return Ok(OperationStatus::Running);
        }
        Ok(match &operation.outcome {
            Ok(()) => OperationStatus::Success,
            Err(message) => OperationStatus::Error(message.clone()),
        })
    }

    async fn search_datastore(
        &self,
        folder: &DatastorePath,
        pattern: &str,
    ) -> Result<Vec<DatastoreFile>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.take_fault(FaultPoint::Search) {
            return Err(ProviderError::Fault(
                "injected datastore search fault".to_owned(),
            ));
        }

        let pattern = glob::Pattern::new(pattern).map_err(|e| {
            ProviderError::Fault(format!("invalid pattern {pattern:?}: {e}"))
        })?;
        let ds = state.inventory.datastore(folder.datastore())?;
        if !ds.exists(folder.path()) {
            return Err(ProviderError::Fault(format!("{folder} was not found")));
        }

        let files = ds
            .files
            .iter()
            .filter(|(path, _)| {
                let (parent, name) =
                    path.rsplit_once('/').unwrap_or(("", path.as_str()));
                parent == folder.path() && pattern.matches(name)
            })
            .map(|(path, file)| DatastoreFile {
                path: DatastorePath::new(folder.datastore(), path.clone()),
                capacity_kb: file.capacity_kb,
            })
            .collect();
        Ok(files)
    }

    async fn path_exists(
        &self,
        path: &DatastorePath,
    ) -> Result<bool, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state.inventory.datastore(path.datastore())?.exists(path.path()))
    }

    async fn make_directory(
        &self,
        datacenter: &str,
        path: &DatastorePath,
        create_parents: bool,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.check_datacenter(datacenter)?;
        if state.take_fault(FaultPoint::MakeDirectory) {
            return Err(ProviderError::Fault(format!(
                "injected fault creating {path}"
            )));
        }

        let ds = state.inventory.datastore_mut(path.datastore())?;
        if ds.exists(path.path()) {
            return Err(ProviderError::Fault(format!("{path} already exists")));
        }
        if let Some((parent, _)) = path.path().rsplit_once('/') {
            if !create_parents && !ds.exists(parent) {
                return Err(ProviderError::Fault(format!(
                    "parent of {path} does not exist"
                )));
            }
        }
        ds.create_dir_all(path.path());
        info!(self.log, "directory created"; "path" => %path);
        Ok(())
    }

    async fn create_virtual_disk(
        &self,
        datacenter: &str,
        path: &DatastorePath,
        spec: VirtualDiskSpec,
    ) -> Result<OperationHandle, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.check_datacenter(datacenter)?;

        let outcome = if state.take_fault(FaultPoint::CreateDisk) {
            Err(format!("injected fault creating {path}"))
        } else {
            let ds = state.inventory.datastore_mut(path.datastore())?;
            let parent = path.path().rsplit_once('/').map_or("", |(p, _)| p);
            if ds.exists(path.path()) {
                Err(format!("{path} already exists"))
            } else if !ds.exists(parent) {
                Err(format!("directory of {path} does not exist"))
            } else {
                ds.files.insert(
                    path.path().to_owned(),
                    SimFile {
                        capacity_kb: spec.capacity_kb,
                        provisioning: spec.provisioning,
                    },
                );
                Ok(())
            }
        };
        Ok(state.start_operation(outcome))
    }

    async fn machines_using_datastore(
        &self,
        datastore: &str,
    ) -> Result<Vec<MachineRef>, ProviderError> {
        let state = self.state.lock().unwrap();
        state.inventory.datastore(datastore)?;
        let prefix = DatastorePath::new(datastore, "");
        Ok(state
            .inventory
            .machines
            .iter()
            .filter(|(_, m)| m.layout().iter().any(|f| prefix.is_prefix_of(f)))
            .map(|(name, _)| MachineRef::new(name.clone()))
            .collect())
    }

    async fn collect_file_layouts(
        &self,
        machines: &[MachineRef],
    ) -> Result<Vec<FileLayout>, ProviderError> {
        let state = self.state.lock().unwrap();
        let mut layouts = Vec::with_capacity(machines.len());
        for vm in machines {
            let machine = state
                .inventory
                .machines
                .get(vm.name())
                .ok_or_else(|| ProviderError::MachineNotFound(vm.clone()))?;
            layouts.push(FileLayout {
                machine: vm.clone(),
                files: machine.layout(),
            });
        }
        Ok(layouts)
    }

    async fn annotation(
        &self,
        vm: &MachineRef,
        key: &str,
    ) -> Result<Option<String>, ProviderError> {
        let state = self.state.lock().unwrap();
        let machine = state
            .inventory
            .machines
            .get(vm.name())
            .ok_or_else(|| ProviderError::MachineNotFound(vm.clone()))?;
        Ok(machine.annotations.get(key).cloned())
    }
}
