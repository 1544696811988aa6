// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use thiserror::Error;
use vdisk_types::{DatastorePath, PathError, MAX_SCSI_CONTROLLERS};

use crate::provider::{MachineRef, ProviderError};

/// A single schema violation found while validating a disk list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigProblem {
    /// Zero-based position of the offending entry in the list.
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk {}: {}", self.index, self.reason)
    }
}

struct Problems<'a>(&'a [ConfigProblem]);

impl fmt::Display for Problems<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, problem) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{problem}")?;
        }
        Ok(())
    }
}

/// Errors produced while reconciling or detaching disks.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid disk configuration: {}", Problems(.0))]
    Config(Vec<ConfigProblem>),

    #[error(transparent)]
    PathFormat(#[from] PathError),

    #[error("virtual disk {0} not found")]
    NotFound(DatastorePath),

    #[error("found {count} virtual disks matching {path}")]
    DuplicateDisk { path: DatastorePath, count: usize },

    #[error("virtual disk {path} is already attached to machine {machine}")]
    AttachedElsewhere { path: DatastorePath, machine: MachineRef },

    #[error(
        "machine {0} has {} SCSI controllers and all of them are full",
        MAX_SCSI_CONTROLLERS
    )]
    ResourceExhausted(MachineRef),

    #[error("{context}")]
    ProviderFault {
        context: String,
        #[source]
        source: ProviderError,
    },
}

/// Coarse classification of [`Error`], stable enough for a front end to map
/// onto process exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Config,
    PathFormat,
    NotFound,
    Conflict,
    ResourceExhausted,
    ProviderFault,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::PathFormat(_) => ErrorKind::PathFormat,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DuplicateDisk { .. } | Error::AttachedElsewhere { .. } => {
                ErrorKind::Conflict
            }
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::ProviderFault { .. } => ErrorKind::ProviderFault,
        }
    }

    /// Returns a closure that wraps a [`ProviderError`] with a description of
    /// what was being attempted, for use with `map_err`.
    pub(crate) fn provider(
        context: impl fmt::Display,
    ) -> impl FnOnce(ProviderError) -> Error {
        let context = context.to_string();
        move |source| Error::ProviderFault { context, source }
    }
}
