//! Stage runner: one streaming generation call relayed token by token

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::decoder::token_stream;
use super::error::StageError;
use crate::config::StageConfig;
use crate::events::OutboundEvent;
use crate::sink::EventSink;

/// Upper bound on reading leftover bytes after the sentinel
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs one pipeline stage against its upstream service
///
/// Implementations forward every token to `sink` as a `<stage>_token` event
/// the moment it is decoded and return the stage's full text.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, stage: &StageConfig, prompt: &str, sink: &mut EventSink) -> Result<String, StageError>;
}

/// Runs stages against OpenAI-compatible chat-completions endpoints
#[derive(Debug, Clone)]
pub struct HttpStageRunner {
    http: Client,
}

impl HttpStageRunner {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = Client::builder().build()?;
        Ok(Self { http })
    }

    /// Use an existing client; its connection pool is shared by every session
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    /// Build the request body for a streaming chat completion
    pub fn build_request_body(stage: &StageConfig, prompt: &str) -> serde_json::Value {
        debug!(stage = %stage.name, model = %stage.model, "build_request_body: called");
        serde_json::json!({
            "model": stage.model,
            "messages": [
                {"role": "system", "content": stage.system_prompt},
                {"role": "user", "content": prompt},
            ],
            "temperature": stage.temperature,
            "max_tokens": stage.max_tokens,
            "stream": true,
        })
    }
}

#[async_trait]
impl StageRunner for HttpStageRunner {
    async fn run(&self, stage: &StageConfig, prompt: &str, sink: &mut EventSink) -> Result<String, StageError> {
        debug!(stage = %stage.name, prompt_len = prompt.len(), "run: called");
        let Some(api_key) = stage.api_key.as_deref() else {
            return Err(StageError::MissingCredential {
                stage: stage.name.clone(),
                env: stage.api_key_env.clone(),
            });
        };

        let body = Self::build_request_body(stage, prompt);
        let request = self
            .http
            .post(&stage.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("content-type", "application/json")
            .timeout(stage.timeout)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = sink.closed() => {
                debug!(stage = %stage.name, "run: client gone before upstream answered");
                return Err(sink_gone());
            }
            response = request => response.map_err(|e| StageError::from_transport(e, stage.timeout))?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            warn!(stage = %stage.name, status, "run: upstream error");
            return Err(StageError::Upstream { status, body: text });
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut full_content = String::new();
        let mut token_count = 0usize;
        {
            let tokens = token_stream(&mut body);
            tokio::pin!(tokens);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = sink.closed() => {
                        debug!(stage = %stage.name, token_count, "run: client gone mid-stream");
                        return Err(sink_gone());
                    }
                    next = tokens.next() => next,
                };
                let Some(token) = next else {
                    break;
                };
                let token = token.map_err(|e| StageError::from_transport(e, stage.timeout))?;
                sink.send(&OutboundEvent::Token {
                    stage: &stage.name,
                    token: &token,
                })
                .await?;
                full_content.push_str(&token);
                token_count += 1;
            }
        }

        // Bytes after the sentinel are read off so the connection can be reused.
        let drain = async {
            while let Some(rest) = body.next().await {
                if rest.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            biased;
            _ = sink.closed() => {
                debug!(stage = %stage.name, token_count, "run: client gone while draining");
                return Err(sink_gone());
            }
            drained = tokio::time::timeout(DRAIN_TIMEOUT, drain) => {
                if drained.is_err() {
                    debug!(stage = %stage.name, "run: upstream kept the body open after the sentinel");
                }
            }
        }

        info!(stage = %stage.name, token_count, chars = full_content.len(), "run: stage complete");
        Ok(full_content)
    }
}

fn sink_gone() -> StageError {
    StageError::Sink(crate::sink::SinkError::Disconnected)
}
