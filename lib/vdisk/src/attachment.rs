// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{debug, Logger};
use vdisk_types::DatastorePath;

use crate::error::Error;
use crate::provider::{ControlPlane, MachineRef};

/// Which machine, if any, already uses a backing file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachmentState {
    None,
    ThisMachine,
    OtherMachine(MachineRef),
}

/// Determines whether a backing file is attached to a machine by looking at
/// the file layout of every machine that uses the file's datastore.
///
/// This is one bulk query per call but its cost grows with the number of
/// machines and files on the datastore.
pub struct AttachmentChecker<'a> {
    control_plane: &'a dyn ControlPlane,
    log: &'a Logger,
}

impl<'a> AttachmentChecker<'a> {
    pub fn new(control_plane: &'a dyn ControlPlane, log: &'a Logger) -> Self {
        Self { control_plane, log }
    }

    /// Any other machine using `path` takes precedence over `vm` itself
    /// using it.
    pub async fn check(
        &self,
        path: &DatastorePath,
        vm: &MachineRef,
    ) -> Result<AttachmentState, Error> {
        let machines = self
            .control_plane
            .machines_using_datastore(path.datastore())
            .await
            .map_err(Error::provider(format!(
                "listing machines on datastore {}",
                path.datastore()
            )))?;
        if machines.is_empty() {
            return Ok(AttachmentState::None);
        }

        let layouts = self
            .control_plane
            .collect_file_layouts(&machines)
            .await
            .map_err(Error::provider("collecting machine file layouts"))?;

        let mut state = AttachmentState::None;
        for layout in layouts {
            if !layout.files.iter().any(|file| path.is_prefix_of(file)) {
                continue;
            }

            debug!(self.log, "backing file in use";
                "path" => %path,
                "machine" => %layout.machine,
            );
            if &layout.machine == vm {
                state = AttachmentState::ThisMachine;
            } else {
                return Ok(AttachmentState::OtherMachine(layout.machine));
            }
        }

        Ok(state)
    }
}
