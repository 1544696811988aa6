// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checking a disk list against the create/attach schema.

use vdisk_types::{DiskSpec, DiskType};

use crate::error::{ConfigProblem, Error};

/// A disk entry that passed validation.
///
/// Paths are kept as written. Their format is checked when the disk is
/// reconciled, so a malformed path fails only its own disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DesiredDisk {
    /// Create the backing file if it does not exist, then attach it. Without
    /// a path, one is derived from the machine name.
    Create {
        path: Option<String>,
        size: u64,
        disk_type: DiskType,
        datastore: Option<String>,
    },
    /// Attach a backing file that must already exist.
    Attach { path: String, datastore: Option<String> },
}

impl DesiredDisk {
    pub fn datastore(&self) -> Option<&str> {
        match self {
            DesiredDisk::Create { datastore, .. }
            | DesiredDisk::Attach { datastore, .. } => datastore.as_deref(),
        }
    }
}

/// Validates every entry of `disks` before anything is done with any of
/// them. All problems are reported together.
pub fn validate(disks: &[DiskSpec]) -> Result<Vec<DesiredDisk>, Error> {
    let mut desired = Vec::with_capacity(disks.len());
    let mut problems = Vec::new();

    for (index, disk) in disks.iter().enumerate() {
        match validate_one(disk) {
            Ok(d) => desired.push(d),
            Err(reasons) => problems.extend(
                reasons
                    .into_iter()
                    .map(|reason| ConfigProblem { index, reason }),
            ),
        }
    }

    if problems.is_empty() {
        Ok(desired)
    } else {
        Err(Error::Config(problems))
    }
}

fn validate_one(disk: &DiskSpec) -> Result<DesiredDisk, Vec<String>> {
    let mut reasons = Vec::new();
    let path = disk.path.clone();

    if let Some(datastore) = &disk.datastore_name {
        if datastore.is_empty() {
            reasons.push("'datastore_name' must not be empty".to_owned());
        }
    }

    let datastore = disk.datastore_name.clone();
    let desired = match disk.create {
        None => {
            reasons.push("missing required attribute 'create'".to_owned());
            None
        }
        Some(true) => {
            if disk.disk_type.is_none() {
                reasons.push(
                    "'create' is set but 'type' is missing".to_owned(),
                );
            }
            match disk.size {
                None => reasons
                    .push("'create' is set but 'size' is missing".to_owned()),
                Some(0) => reasons.push("'size' must be positive".to_owned()),
                Some(size) if size_kb(size).is_none() => {
                    reasons.push(format!("'size' {size} is too large"))
                }
                Some(_) => {}
            }
            match (disk.size, disk.disk_type) {
                (Some(size), Some(disk_type)) => Some(DesiredDisk::Create {
                    path,
                    size,
                    disk_type,
                    datastore,
                }),
                _ => None,
            }
        }
        Some(false) => match path {
            Some(path) => Some(DesiredDisk::Attach { path, datastore }),
            None => {
                reasons.push(
                    "missing required attribute 'path' for an existing disk"
                        .to_owned(),
                );
                None
            }
        },
    };

    match desired {
        Some(desired) if reasons.is_empty() => Ok(desired),
        _ => Err(reasons),
    }
}

/// Converts a size in GB to the KB the control plane works in.
pub fn size_kb(size_gb: u64) -> Option<u64> {
    size_gb.checked_mul(1024)
}

#[cfg(test)]
mod test {
    use super::*;

    fn create(
        path: Option<&str>,
        size: Option<u64>,
        ty: Option<DiskType>,
    ) -> DiskSpec {
        DiskSpec {
            create: Some(true),
            path: path.map(str::to_owned),
            size,
            disk_type: ty,
            datastore_name: None,
        }
    }

    fn attach(path: Option<&str>) -> DiskSpec {
        DiskSpec {
            create: Some(false),
            path: path.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn valid_entries() {
        let desired = validate(&[
            create(Some("vmA/vmA_1.vmdk"), Some(10), Some(DiskType::Thin)),
            create(None, Some(1), Some(DiskType::Thick)),
            attach(Some("shared/data.vmdk")),
        ])
        .unwrap();

        assert_eq!(desired.len(), 3);
        assert!(matches!(
            &desired[0],
            DesiredDisk::Create { path: Some(p), size: 10, .. }
                if p == "vmA/vmA_1.vmdk"
        ));
        assert!(matches!(&desired[1], DesiredDisk::Create { path: None, .. }));
        assert!(matches!(&desired[2], DesiredDisk::Attach { .. }));
    }

    #[test]
    fn empty_list_is_valid() {
        assert_eq!(validate(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn every_problem_is_reported() {
        let err = validate(&[
            DiskSpec {
                path: Some("a/b.vmdk".to_owned()),
                ..Default::default()
            },
            create(Some("a/c.vmdk"), None, None),
            attach(None),
            attach(Some("justafile.vmdk")),
            create(Some("a/d.vmdk"), Some(0), Some(DiskType::Thin)),
            create(Some("a/e.vmdk"), Some(4), Some(DiskType::Thin)),
            create(
                Some("a/f.vmdk"),
                Some(u64::MAX / 512),
                Some(DiskType::Thin),
            ),
        ])
        .unwrap_err();

        let Error::Config(problems) = err else {
            panic!("expected a configuration error");
        };
        let indices: Vec<usize> = problems.iter().map(|p| p.index).collect();
        // Entry 1 lacks both type and size; entry 3's path is checked later.
        assert_eq!(indices, vec![0, 1, 1, 2, 4, 6]);
        assert!(problems[0].reason.contains("'create'"));
        assert!(problems[3].reason.contains("'path'"));
        assert!(problems[4].reason.contains("positive"));
        assert!(problems[5].reason.contains("too large"));
    }

    #[test]
    fn malformed_paths_pass_validation() {
        let desired = validate(&[attach(Some("justafile.vmdk"))]).unwrap();
        assert_eq!(
            desired,
            vec![DesiredDisk::Attach {
                path: "justafile.vmdk".to_owned(),
                datastore: None,
            }]
        );
    }

    #[test]
    fn largest_size_that_fits() {
        assert_eq!(size_kb(u64::MAX / 1024), Some(u64::MAX / 1024 * 1024));
        assert_eq!(size_kb(u64::MAX / 1024 + 1), None);
    }
}
