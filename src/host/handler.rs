//! Production host command handler backed by [`UpdateEngine`].

use crate::error::Result;
use crate::host::channel::UpdateCommandHandler;
use crate::progress::ProgressCallback;
use crate::update::session::{RunOutcome, UpdateEngine};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Routes host commands to a shared [`UpdateEngine`].
///
/// Downloads observe the handler's cancellation token, so shutting the bridge
/// down abandons an in-flight transfer before anything on disk is replaced.
pub struct EngineHandler {
    engine: Arc<UpdateEngine>,
    cancel: CancellationToken,
}

impl EngineHandler {
    #[must_use]
    pub fn new(engine: Arc<UpdateEngine>) -> Self {
        Self {
            engine,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<UpdateEngine> {
        &self.engine
    }

    /// Token cancelled when the bridge shuts down.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl UpdateCommandHandler for EngineHandler {
    fn host_version(&self) -> String {
        self.engine.handoff().reported_version().to_string()
    }

    fn check_for_update(&self) -> Result<serde_json::Value> {
        let result = self.engine.check_for_update();
        if let Some(error) = &result.error {
            tracing::warn!(error = %error, "update check reported a failure");
        }
        Ok(serde_json::to_value(result.to_response()).unwrap_or(serde_json::Value::Null))
    }

    fn download(
        &self,
        url: &str,
        auto_install: bool,
        progress: ProgressCallback,
    ) -> Result<serde_json::Value> {
        let outcome =
            self.engine
                .download_and_install(url, auto_install, Some(&self.cancel), Some(&progress))?;
        Ok(serde_json::to_value(outcome.to_response()).unwrap_or(serde_json::Value::Null))
    }

    fn run_updater(&self, updater_path: &str) -> Result<serde_json::Value> {
        let outcome = self.engine.run_updater(Path::new(updater_path))?;
        Ok(run_response(&outcome))
    }

    fn request_exit(&self) -> Result<bool> {
        self.cancel.cancel();
        Ok(self.engine.request_exit())
    }
}

fn run_response(outcome: &RunOutcome) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "data": {
            "updaterType": outcome.updater_type,
            "installerPid": outcome.installer_pid,
            "installed": outcome.install.as_ref().is_some_and(|r| r.installed),
            "relaunched": outcome.install.as_ref().is_some_and(|r| r.relaunched),
            "exiting": outcome.exiting,
        }
    })
}
