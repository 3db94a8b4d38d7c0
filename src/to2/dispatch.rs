//! Service-info module dispatcher: the auxiliary task of the service-info
//! loop. Reads reassembled owner messages, routes them to registered
//! modules by name, and collects module output into the device-send pipe.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{ModuleError, PipeError};
use crate::serviceinfo::{ServiceInfoModule, UnchunkReader, UnchunkWriter};

pub(crate) type ModuleMap = BTreeMap<String, Arc<dyn ServiceInfoModule>>;

/// Run the dispatcher until the owner-receive pipe ends or a module fails.
///
/// On any exit path the device-send pipe is closed so the driver never
/// blocks reading it; a module failure closes it with the error.
pub(crate) async fn run(
    modules: ModuleMap,
    mut recv: UnchunkReader,
    mut send: UnchunkWriter,
    cancel: CancellationToken,
) -> Result<(), ModuleError> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                send.close_with_error(PipeError::Cancelled);
                return Ok(());
            }
            next = recv.next_service_info() => next,
        };

        match next {
            Ok(Some((key, value))) => {
                let (module, message) = key.split_once(':').unwrap_or((key.as_str(), ""));
                let Some(handler) = modules.get(module) else {
                    tracing::warn!(module, message, "dropping service info for unknown module");
                    continue;
                };

                tracing::debug!(module, message, len = value.len(), "dispatching service info");
                if let Err(err) = handler.handle(message, &value, &mut send).await {
                    tracing::warn!(module, error = %err, "service info module failed");
                    send.close_with_error(PipeError::Poisoned(err.to_string()));
                    return Err(err);
                }
            }
            // End of owner input for this round: flush module output.
            Ok(None) => {
                let _ = send.close();
                return Ok(());
            }
            Err(err) => {
                send.close_with_error(err);
                return Ok(());
            }
        }
    }
}
