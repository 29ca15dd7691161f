//! Router plugins.

use std::sync::Arc;

use tracing::{error, info};

use super::{Router, RouterPlugin};
use crate::utils::error::Result;

/// Closes the router when the process receives Ctrl-C.
pub fn signals_handler() -> RouterPlugin {
    Arc::new(close_on_signal)
}

fn close_on_signal(router: &Router) -> Result<()> {
    let router = router.clone();
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(error = %err, "Cannot listen for shutdown signal");
                    return;
                }
                info!("Received interrupt signal, closing router");
            }
            _ = router.inner.closing.cancelled() => return,
        }
        if let Err(err) = router.close().await {
            error!(error = %err, "Cannot close router");
        }
    });
    Ok(())
}
