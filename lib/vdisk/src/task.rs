// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving long-running remote operations to completion.

use std::time::Duration;

use slog::{debug, Logger};

use crate::provider::{
    ControlPlane, OperationHandle, OperationStatus, ProviderError,
};

/// Polls remote operations until they succeed or fail.
///
/// There is no deadline: a remote operation that never settles stalls the
/// caller indefinitely.
#[derive(Clone, Debug)]
pub struct OperationWaiter {
    initial_interval: Duration,
    max_interval: Duration,
}

impl Default for OperationWaiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2))
    }
}

impl OperationWaiter {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval: max_interval.max(initial_interval),
        }
    }

    /// Blocks until `op` settles. A failed operation, or a failure to query
    /// its status, is returned as an error.
    pub async fn wait(
        &self,
        control_plane: &dyn ControlPlane,
        op: &OperationHandle,
        log: &Logger,
    ) -> Result<(), ProviderError> {
        let policy = backoff::ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };

        debug!(log, "waiting for operation"; "op" => %op);
        backoff::future::retry(policy, move || async move {
            match control_plane.operation_status(op).await {
                Ok(OperationStatus::Running) => Err(backoff::Error::transient(
                    ProviderError::OperationPending(op.clone()),
                )),
                Ok(OperationStatus::Success) => Ok(()),
                Ok(OperationStatus::Error(message)) => {
                    Err(backoff::Error::permanent(
                        ProviderError::OperationFailed {
                            op: op.clone(),
                            message,
                        },
                    ))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::MockControlPlane;
    use slog::{o, Discard};

    fn fast_waiter() -> OperationWaiter {
        OperationWaiter::new(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn polls_until_success() {
        let mut cp = MockControlPlane::new();
        let mut remaining = 3;
        cp.expect_operation_status().times(4).returning(move |_| {
            if remaining == 0 {
                Ok(OperationStatus::Success)
            } else {
                remaining -= 1;
                Ok(OperationStatus::Running)
            }
        });

        let log = Logger::root(Discard, o!());
        fast_waiter().wait(&cp, &OperationHandle(7), &log).await.unwrap();
    }

    #[tokio::test]
    async fn failed_operation_is_permanent() {
        let mut cp = MockControlPlane::new();
        cp.expect_operation_status()
            .times(1)
            .returning(|_| Ok(OperationStatus::Error("disk busy".to_owned())));

        let log = Logger::root(Discard, o!());
        let err = fast_waiter()
            .wait(&cp, &OperationHandle(3), &log)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::OperationFailed { op: OperationHandle(3), .. }
        ));
    }

    #[tokio::test]
    async fn status_query_failure_is_reported() {
        let mut cp = MockControlPlane::new();
        cp.expect_operation_status().times(1).returning(|op| {
            Err(ProviderError::UnknownOperation(op.clone()))
        });

        let log = Logger::root(Discard, o!());
        let err = fast_waiter()
            .wait(&cp, &OperationHandle(9), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownOperation(_)));
    }
}
