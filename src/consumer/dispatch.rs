//! Invoke every processor subscribed to a delivery and combine their results.

use futures::FutureExt as _;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::driver::Session;
use crate::message::Message;
use crate::processor::{ProcessResult, Processor, ProcessorError};

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "processor panicked".to_string())
}

/// Run all `processors` against one delivery.
///
/// Every processor runs even after another has asked for a reject; the
/// combined result is the highest-precedence one. Failures map to REQUEUE
/// when retryable and REJECT otherwise. A panic counts as retryable.
pub(super) async fn dispatch(
    processors: &[Arc<dyn Processor>],
    message: &Message,
    session: &dyn Session,
) -> ProcessResult {
    let mut combined = ProcessResult::Ack;

    for processor in processors {
        let outcome = AssertUnwindSafe(processor.process(message, session))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ProcessorError::retryable(format!(
                    "panic: {}",
                    panic_reason(panic.as_ref())
                )))
            });
        let result = match outcome {
            Ok(result) => result,
            Err(failure) => {
                warn!(
                    processor = processor.name(),
                    retryable = failure.retryable,
                    error = %failure,
                    "processor failed"
                );
                failure.result()
            }
        };
        debug!(processor = processor.name(), %result, "processor returned");
        combined = combined.combine(result);
    }

    combined
}
