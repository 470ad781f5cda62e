//! Queue provisioning: declare every physical queue the registry knows about.
//!
//! Safe to run on every deployment; driver queue creation is idempotent.

use tracing::{error, info};

use crate::destination::DestinationRegistry;
use crate::driver::Driver;
use crate::error::Error;

/// A queue that could not be declared.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub queue: String,
    pub error: Error,
}

/// Result of a provisioning run.
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Queues declared, in declaration order.
    pub created: Vec<String>,
    pub failed: Vec<ProvisionFailure>,
}

impl ProvisionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Declare the queue behind every destination in the registry, once per
/// physical queue (see [`DestinationRegistry::queues`]).
///
/// A failing queue does not stop the run; every failure is reported.
/// `on_created` is called with each queue name as soon as it is declared.
pub async fn provision_queues<F>(
    registry: &DestinationRegistry,
    driver: &dyn Driver,
    mut on_created: F,
) -> ProvisionReport
where
    F: FnMut(&str),
{
    let mut report = ProvisionReport::default();

    for (queue, options) in registry.queues() {
        match driver.create_queue(&queue, &options).await {
            Ok(()) => {
                info!(queue = %queue, driver = driver.name(), "queue declared");
                on_created(&queue);
                report.created.push(queue);
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "queue declaration failed");
                report.failed.push(ProvisionFailure { queue, error: e });
            }
        }
    }

    report
}
