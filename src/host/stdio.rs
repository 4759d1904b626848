//! Newline-delimited JSON bridge for the host command channel.
//!
//! Reads `CommandEnvelope` lines from the input, dispatches them through the
//! `HostCommandServer` router, and writes `ResponseEnvelope` and
//! `EventEnvelope` lines to the output.
//!
//! When the output is stdout it is reserved for the JSON protocol; all
//! diagnostic output (tracing, logs) must be routed to stderr.

use crate::config::HostConfig;
use crate::error::{Result, UpdraftError};
use crate::host::channel::{HostCommandClient, UpdateCommandHandler, command_channel};
use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Run the bridge over the process's stdin and stdout.
pub async fn run_stdio_bridge<H: UpdateCommandHandler>(
    handler: H,
    config: &HostConfig,
) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    run_bridge(stdin, tokio::io::stdout(), handler, config).await
}

/// Run the bridge until the input closes or an `app.exit` command has been
/// answered.
///
/// Commands are dispatched without waiting for earlier ones to finish, so a
/// ping is answered while a download is in flight. Responses are written in
/// completion order; callers match them by `request_id`.
pub async fn run_bridge<R, W, H>(
    reader: R,
    writer: W,
    handler: H,
    config: &HostConfig,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    H: UpdateCommandHandler,
{
    let (client, server) = command_channel(config.request_capacity, config.event_capacity, handler);
    let writer: SharedWriter<W> = Arc::new(Mutex::new(BufWriter::new(writer)));

    let server_handle = tokio::spawn(server.run());

    let event_writer = Arc::clone(&writer);
    let mut event_rx = client.subscribe_events();
    let event_handle = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event_envelope) => match serde_json::to_string(&event_envelope) {
                    Ok(json) => {
                        let mut w = event_writer.lock().await;
                        if let Err(e) = write_line(&mut w, &json).await {
                            tracing::warn!(
                                error = %e,
                                "failed to write event envelope; stopping event forwarder"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize event envelope; skipping");
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("event broadcast channel closed; stopping event forwarder");
                    break;
                }
            }
        }
    });

    let reader_result = run_reader(reader, client, Arc::clone(&writer)).await;

    // The server exits once every client clone is gone; the forwarder then
    // drains buffered events and sees the broadcast close.
    let _ = server_handle.await;
    let _ = event_handle.await;

    reader_result
}

async fn run_reader<R, W>(
    mut reader: R,
    client: HostCommandClient,
    writer: SharedWriter<W>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut line = String::new();
    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| UpdraftError::Channel(format!("failed to read command input: {e}")))?;

        if bytes_read == 0 {
            tracing::info!("command input closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(&writer, &response).await?;
                continue;
            }
        };

        if envelope.command == CommandName::AppExit {
            let response = dispatch(&client, envelope).await;
            write_response(&writer, &response).await?;
            tracing::info!("app.exit received; shutting down bridge");
            break;
        }

        let client = client.clone();
        let writer = Arc::clone(&writer);
        in_flight.spawn(async move {
            let response = dispatch(&client, envelope).await;
            if let Err(e) = write_response(&writer, &response).await {
                tracing::warn!(error = %e, "failed to write response envelope");
            }
        });
    }

    drop(client);
    while in_flight.join_next().await.is_some() {}
    Ok(())
}

async fn dispatch(client: &HostCommandClient, envelope: CommandEnvelope) -> ResponseEnvelope {
    let request_id = envelope.request_id.clone();
    match client.send(envelope).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "host command dispatch failed");
            let id = if request_id.trim().is_empty() {
                "dispatch-error".to_owned()
            } else {
                request_id
            };
            ResponseEnvelope::error(id, format!("dispatch failed: {e}"))
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &Mutex<BufWriter<W>>,
    response: &ResponseEnvelope,
) -> Result<()> {
    let json = serde_json::to_string(response).map_err(|e| {
        UpdraftError::Channel(format!("failed to serialize response envelope: {e}"))
    })?;
    let mut w = writer.lock().await;
    write_line(&mut w, &json).await
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| UpdraftError::Channel(format!("failed to write output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| UpdraftError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| UpdraftError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::host::contract::EVENT_VERSION;
    use crate::progress::ProgressCallback;

    struct PingOnly;

    impl UpdateCommandHandler for PingOnly {
        fn host_version(&self) -> String {
            "0.2.7".to_owned()
        }
        fn check_for_update(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"hasUpdate": false}))
        }
        fn download(
            &self,
            _url: &str,
            _auto_install: bool,
            _progress: ProgressCallback,
        ) -> Result<serde_json::Value> {
            Err(UpdraftError::Network("offline".into()))
        }
        fn run_updater(&self, _updater_path: &str) -> Result<serde_json::Value> {
            Err(UpdraftError::Install("nothing prepared".into()))
        }
        fn request_exit(&self) -> Result<bool> {
            Ok(true)
        }
    }

    async fn run_lines(input: &str) -> Vec<serde_json::Value> {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        run_bridge(
            input.as_bytes(),
            server_end,
            PingOnly,
            &HostConfig::default(),
        )
        .await
        .expect("bridge in test");

        let mut out = String::new();
        let mut reader = BufReader::new(client_end);
        while reader.read_line(&mut out).await.expect("read in test") > 0 {}
        out.lines()
            .map(|l| serde_json::from_str(l).expect("json line in test"))
            .collect()
    }

    #[tokio::test]
    async fn answers_each_command_and_reports_parse_errors() {
        let lines = run_lines(
            "{\"v\":1,\"request_id\":\"a\",\"command\":\"host.ping\"}\n\
             not json\n\
             \n\
             {\"v\":1,\"request_id\":\"b\",\"command\":\"update.download\",\"payload\":{\"url\":\"https://x/y.zip\"}}\n",
        )
        .await;

        assert_eq!(lines.len(), 3);
        let by_id = |id: &str| {
            lines
                .iter()
                .find(|l| l["request_id"] == id)
                .cloned()
                .expect("response in test")
        };
        assert_eq!(by_id("a")["payload"]["pong"], true);
        assert_eq!(by_id("parse-error")["ok"], false);
        let failed = by_id("b");
        assert_eq!(failed["ok"], false);
        assert!(failed["error"].as_str().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn app_exit_stops_reading() {
        let lines = run_lines(
            "{\"v\":1,\"request_id\":\"x\",\"command\":\"app.exit\"}\n\
             {\"v\":1,\"request_id\":\"late\",\"command\":\"host.ping\"}\n",
        )
        .await;

        let responses: Vec<_> = lines.iter().filter(|l| l.get("ok").is_some()).collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["request_id"], "x");
        assert_eq!(responses[0]["payload"]["scheduled"], true);
    }

    #[test]
    fn parse_error_response_is_well_formed() {
        let resp = ResponseEnvelope::error("parse-error", "bad json");
        assert!(!resp.ok);
        assert_eq!(resp.v, EVENT_VERSION);
        assert!(resp.error.is_some());
    }
}
