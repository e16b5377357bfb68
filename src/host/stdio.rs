//! Stdin/stdout JSON bridge for the host command channel.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages from stdin,
//! routes them through a [`HostHandler`], and writes `ResponseEnvelope` and
//! `EventEnvelope` messages as newline-delimited JSON to stdout.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.
//!
//! The bridge is a single `select!` loop over three sources: host commands,
//! backend events and the frame clock. Nothing else touches the engine, so
//! each input is applied to completion before the next one is looked at.

use crate::error::{Result, SyncError};
use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use crate::host::handler::{HostHandler, event_envelope, frame_envelope};
use crate::runtime::AvatarEvent;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// Run the bridge on the process's stdin and stdout until stdin closes or
/// a `runtime.stop` command is received.
///
/// # Errors
///
/// Returns [`SyncError::Channel`] if stdin or stdout fail.
pub async fn run_stdio_bridge(handler: HostHandler) -> Result<()> {
    run_bridge(
        handler,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Run the bridge over arbitrary line reader and writer.
///
/// # Errors
///
/// Returns [`SyncError::Channel`] if reading or writing fails.
pub async fn run_bridge<R, W>(mut handler: HostHandler, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut writer = BufWriter::new(writer);
    let mut avatar_rx = handler.subscribe();

    let period = handler.frame_period();
    let clocked = period.is_some();
    let mut ticker = tokio::time::interval(period.unwrap_or(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line
                    .map_err(|e| SyncError::Channel(format!("failed to read from stdin: {e}")))?;
                let Some(line) = line else {
                    tracing::info!("stdin closed (EOF); shutting down host bridge");
                    break;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let (response, stop) = handle_line(&mut handler, trimmed);
                write_json(&mut writer, &response).await?;
                forward_events(&mut avatar_rx, &mut writer).await?;
                if stop {
                    tracing::info!("runtime.stop received; shutting down host bridge");
                    break;
                }
            }
            Some(event) = handler.conductor_mut().next_event() => {
                if let Err(e) = handler.conductor_mut().handle_event(&event) {
                    tracing::error!(error = %e, "speech failed");
                }
                forward_events(&mut avatar_rx, &mut writer).await?;
            }
            _ = ticker.tick(), if clocked => {
                let frame = handler.frame();
                forward_events(&mut avatar_rx, &mut writer).await?;
                if handler.streams_frames() {
                    write_json(&mut writer, &frame_envelope(&frame)).await?;
                }
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| SyncError::Channel(format!("failed to flush stdout: {e}")))
}

/// Parse and route one command line. Returns the response and whether the
/// bridge should stop.
fn handle_line(handler: &mut HostHandler, line: &str) -> (ResponseEnvelope, bool) {
    let envelope: CommandEnvelope = match serde_json::from_str(line) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_line = %line,
                "failed to parse command envelope from stdin"
            );
            return (
                ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                ),
                false,
            );
        }
    };
    let response = handler.handle(&envelope);
    let stop = envelope.command == CommandName::RuntimeStop && response.ok;
    (response, stop)
}

/// Write every queued avatar event.
async fn forward_events<W: AsyncWrite + Unpin>(
    rx: &mut broadcast::Receiver<AvatarEvent>,
    writer: &mut BufWriter<W>,
) -> Result<()> {
    loop {
        match rx.try_recv() {
            Ok(event) => write_json(writer, &event_envelope(&event)).await?,
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
            }
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => {
                return Ok(());
            }
        }
    }
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut BufWriter<W>,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| SyncError::Protocol(format!("failed to serialize envelope: {e}")))?;
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| SyncError::Channel(format!("failed to write to stdout: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| SyncError::Channel(format!("failed to write newline to stdout: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| SyncError::Channel(format!("failed to flush stdout: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::backend::PacedLocalBackend;
    use crate::conductor::SpeechConductor;
    use crate::config::{HostConfig, SyncConfig};
    use crate::engine::AvatarSync;
    use crate::host::contract::{CONTRACT_VERSION, EventEnvelope};

    fn handler() -> HostHandler {
        let conductor = SpeechConductor::new(
            AvatarSync::new(&SyncConfig::default()),
            Box::new(PacedLocalBackend::with_word_interval(Duration::from_millis(10))),
            None,
        );
        HostHandler::new(
            conductor,
            &HostConfig {
                frame_rate_hz: 0,
                stream_frames: false,
            },
        )
    }

    async fn run(input: &str) -> Vec<serde_json::Value> {
        let mut output = Vec::new();
        run_bridge(handler(), input.as_bytes(), &mut output)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn parse_errors_are_reported_and_skipped() {
        let out = run("not json\n\n{\"v\":1,\"request_id\":\"a\",\"command\":\"host.ping\",\"payload\":{}}\n").await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["request_id"], "parse-error");
        assert_eq!(out[0]["ok"], false);
        assert_eq!(out[1]["request_id"], "a");
        assert_eq!(out[1]["v"], CONTRACT_VERSION);
    }

    #[tokio::test]
    async fn stop_ends_the_loop_before_later_commands() {
        let out = run(concat!(
            "{\"v\":1,\"request_id\":\"a\",\"command\":\"runtime.stop\",\"payload\":{}}\n",
            "{\"v\":1,\"request_id\":\"b\",\"command\":\"host.ping\",\"payload\":{}}\n",
        ))
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["payload"]["stopping"], true);
    }

    #[tokio::test]
    async fn emotion_changes_are_forwarded_as_events() {
        let out = run(concat!(
            "{\"v\":1,\"request_id\":\"m\",\"command\":\"model.load\",\"payload\":{\"shapes\":[\"aa\",\"sad\"]}}\n",
            "{\"v\":1,\"request_id\":\"e\",\"command\":\"emotion.set\",\"payload\":{\"emotion\":\"sad\"}}\n",
        ))
        .await;
        assert_eq!(out.len(), 3);
        let event: EventEnvelope = serde_json::from_value(out[2].clone()).unwrap();
        assert_eq!(event.event, "emotion.changed");
        assert_eq!(event.payload["emotion"], "sad");
    }
}
