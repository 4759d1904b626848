//! Host command channel and router for the update bridge.

use crate::error::{Result, UpdraftError};
use crate::host::contract::{
    CommandEnvelope, CommandName, EVENT_APP_EXITING, EVENT_UPDATE_PROGRESS, EVENT_VERSION,
    EventEnvelope, ResponseEnvelope,
};
use crate::progress::ProgressCallback;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Backend operations reachable through host commands.
pub trait UpdateCommandHandler: Send + Sync + 'static {
    /// Version this process reports to liveness probes.
    fn host_version(&self) -> String;

    /// Answer an `update.check` request.
    fn check_for_update(&self) -> Result<serde_json::Value>;

    /// Answer an `update.download` request.
    fn download(
        &self,
        url: &str,
        auto_install: bool,
        progress: ProgressCallback,
    ) -> Result<serde_json::Value>;

    /// Answer an `update.run_updater` request.
    fn run_updater(&self, updater_path: &str) -> Result<serde_json::Value>;

    /// Schedule process exit. Returns `false` if already scheduled.
    fn request_exit(&self) -> Result<bool>;
}

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<Result<ResponseEnvelope>>,
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            UpdraftError::Channel(format!(
                "invalid host command envelope {}: {}",
                envelope.request_id, e
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| {
                UpdraftError::Channel(format!("failed to send host command request: {e}"))
            })?;

        response_rx
            .await
            .map_err(|e| UpdraftError::Channel(format!("host command response dropped: {e}")))?
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

/// Routes envelopes to the handler. Cheap to clone into blocking tasks.
pub struct CommandRouter<H: UpdateCommandHandler> {
    handler: Arc<H>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl<H: UpdateCommandHandler> Clone for CommandRouter<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            event_tx: self.event_tx.clone(),
        }
    }
}

pub struct HostCommandServer<H: UpdateCommandHandler> {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    router: CommandRouter<H>,
}

#[must_use]
pub fn command_channel<H: UpdateCommandHandler>(
    request_capacity: usize,
    event_capacity: usize,
    handler: H,
) -> (HostCommandClient, HostCommandServer<H>) {
    let (event_tx, _event_rx) = broadcast::channel(event_capacity.max(1));
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));

    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            router: CommandRouter {
                handler: Arc::new(handler),
                event_tx,
            },
        },
    )
}

impl<H: UpdateCommandHandler> HostCommandServer<H> {
    /// Serve requests until every client is dropped.
    ///
    /// Update work runs on the blocking pool, so pings and exit requests are
    /// answered while a download is in flight, and a second update request is
    /// rejected by the engine rather than queued.
    pub async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            if request.envelope.command.is_blocking() {
                let router = self.router.clone();
                tokio::task::spawn_blocking(move || {
                    let response = router.respond(&request.envelope);
                    let _ = request.response_tx.send(Ok(response));
                });
            } else {
                let response = self.router.respond(&request.envelope);
                let _ = request.response_tx.send(Ok(response));
            }
        }
    }

    /// Route a command envelope to the appropriate handler.
    pub fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        self.router.route(envelope)
    }
}

impl<H: UpdateCommandHandler> CommandRouter<H> {
    /// Route and turn handler errors into error envelopes.
    fn respond(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        self.route(envelope).unwrap_or_else(|e| {
            tracing::warn!(
                request_id = %envelope.request_id,
                command = envelope.command.as_str(),
                error = %e,
                "host command failed"
            );
            ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
        })
    }

    fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        match envelope.command {
            CommandName::HostPing => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({"pong": true}),
            )),
            CommandName::HostVersion => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({
                    "version": self.handler.host_version(),
                    "contract_version": EVENT_VERSION,
                    "channel": "updraft_host_v1"
                }),
            )),
            CommandName::UpdateCheck => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                self.handler.check_for_update()?,
            )),
            CommandName::UpdateDownload => self.handle_download(envelope),
            CommandName::UpdateRunUpdater => self.handle_run_updater(envelope),
            CommandName::AppExit => self.handle_app_exit(envelope),
        }
    }

    fn handle_download(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let url = parse_non_empty_field(&envelope.payload, "url", "update.download")?;
        let auto_install = parse_optional_bool(&envelope.payload, "autoInstall", "update.download")?;

        let progress = self.progress_forwarder(&envelope.request_id);
        let payload = self.handler.download(&url, auto_install, progress)?;
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
    }

    fn handle_run_updater(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let path = parse_non_empty_field(&envelope.payload, "updaterPath", "update.run_updater")?;
        let payload = self.handler.run_updater(&path)?;
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
    }

    fn handle_app_exit(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let scheduled = self.handler.request_exit()?;
        if scheduled {
            self.emit_event(
                EVENT_APP_EXITING,
                serde_json::json!({"request_id": envelope.request_id}),
            );
        }
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"accepted": true, "scheduled": scheduled}),
        ))
    }

    /// Forward progress events of one request as `update.progress` events.
    fn progress_forwarder(&self, request_id: &str) -> ProgressCallback {
        let event_tx = self.event_tx.clone();
        let request_id = request_id.to_owned();
        Box::new(move |event| {
            let payload = serde_json::json!({
                "request_id": request_id,
                "progress": serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
                "fraction": event.fraction(),
            });
            let envelope = EventEnvelope::new(
                uuid::Uuid::new_v4().to_string(),
                EVENT_UPDATE_PROGRESS,
                payload,
            );
            let _ = event_tx.send(envelope);
        })
    }

    fn emit_event(&self, event: &str, payload: serde_json::Value) {
        let envelope =
            EventEnvelope::new(uuid::Uuid::new_v4().to_string(), event.to_owned(), payload);
        let _ = self.event_tx.send(envelope);
    }
}

fn parse_non_empty_field(
    payload: &serde_json::Value,
    field: &str,
    command: &str,
) -> Result<String> {
    let Some(raw) = payload.get(field).and_then(serde_json::Value::as_str) else {
        return Err(UpdraftError::Channel(format!(
            "{command} requires payload.{field}"
        )));
    };
    let value = raw.trim();
    if value.is_empty() {
        return Err(UpdraftError::Channel(format!(
            "{command} requires a non-empty payload.{field}"
        )));
    }
    Ok(value.to_owned())
}

fn parse_optional_bool(payload: &serde_json::Value, field: &str, command: &str) -> Result<bool> {
    match payload.get(field) {
        None | Some(serde_json::Value::Null) => Ok(false),
        Some(serde_json::Value::Bool(value)) => Ok(*value),
        Some(_) => Err(UpdraftError::Channel(format!(
            "{command} payload.{field} must be a boolean when provided"
        ))),
    }
}
