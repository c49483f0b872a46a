//! Smoke-test client: post a query to a running server and print its frames

use std::io::Write;

use eyre::{Context, Result, eyre};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::stage::LineDecoder;
use crate::stage::decoder::DATA_PREFIX;

/// What a checked stream contained
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    /// Frames received
    pub frames: usize,
    /// Node of the last frame, `done` or `error` when the stream ended cleanly
    pub last_node: Option<String>,
}

impl CheckSummary {
    pub fn completed(&self) -> bool {
        self.last_node.as_deref() == Some("done")
    }

    fn record(&mut self, frame: &Value) {
        self.frames += 1;
        self.last_node = frame.get("node").and_then(Value::as_str).map(str::to_string);
    }
}

/// Parse one line of the relay's output into its JSON frame
pub fn parse_frame_line(line: &str) -> Option<Value> {
    let payload = line.trim().strip_prefix(DATA_PREFIX.trim_end())?.trim_start();
    serde_json::from_str(payload).ok()
}

/// Post `query` to `url`, writing each frame to `out` as it arrives
pub async fn run(client: &Client, url: &str, query: &str, out: &mut impl Write) -> Result<CheckSummary> {
    debug!(%url, query_len = query.len(), "check: called");
    let response = client
        .post(url)
        .json(&serde_json::json!({ "query": query }))
        .send()
        .await
        .context(format!("Failed to reach {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(eyre!("Server answered {}: {}", status.as_u16(), body));
    }

    let mut summary = CheckSummary::default();
    let mut lines = LineDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Stream interrupted")?;
        lines.push(&chunk);
        while let Some(line) = lines.next_line() {
            write_frame(&line, &mut summary, out)?;
        }
    }
    if let Some(line) = lines.finish() {
        write_frame(&line, &mut summary, out)?;
    }

    info!(frames = summary.frames, last = ?summary.last_node, "check: stream ended");
    Ok(summary)
}

fn write_frame(line: &str, summary: &mut CheckSummary, out: &mut impl Write) -> Result<()> {
    let Some(frame) = parse_frame_line(line) else {
        return Ok(());
    };
    summary.record(&frame);
    writeln!(out, "{}", frame)?;
    Ok(())
}
