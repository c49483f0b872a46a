//! Outbound events relayed to the client
//!
//! Every event serializes to one flat JSON object whose `node` field names the
//! event. Stage events derive their `node` from the stage name, so a stage
//! called `planner` produces `planner_start`, `planner_token` and
//! `planner_done`.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// One client-facing event; built and serialized immediately, never stored
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent<'a> {
    /// A stage has started
    StageStart { stage: &'a str, status: &'a str },
    /// A text fragment produced by a stage
    Token { stage: &'a str, token: &'a str },
    /// A stage finished; `text` is its full output, sent under `output_field`
    StageDone {
        stage: &'a str,
        output_field: &'a str,
        text: &'a str,
        status: &'a str,
    },
    /// The pipeline halted on a failure
    Error { status: &'a str },
    /// The pipeline completed
    Done { status: &'a str },
}

impl OutboundEvent<'_> {
    /// Value of the `node` discriminator
    pub fn node(&self) -> String {
        match self {
            OutboundEvent::StageStart { stage, .. } => format!("{}_start", stage),
            OutboundEvent::Token { stage, .. } => format!("{}_token", stage),
            OutboundEvent::StageDone { stage, .. } => format!("{}_done", stage),
            OutboundEvent::Error { .. } => "error".to_string(),
            OutboundEvent::Done { .. } => "done".to_string(),
        }
    }

    /// True for the events that end a session's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundEvent::Error { .. } | OutboundEvent::Done { .. })
    }
}

impl Serialize for OutboundEvent<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("node", &self.node())?;
        match self {
            OutboundEvent::StageStart { status, .. } => {
                map.serialize_entry("status", status)?;
            }
            OutboundEvent::Token { token, .. } => {
                map.serialize_entry("token", token)?;
            }
            OutboundEvent::StageDone {
                output_field,
                text,
                status,
                ..
            } => {
                map.serialize_entry(*output_field, text)?;
                map.serialize_entry("status", status)?;
            }
            OutboundEvent::Error { status } | OutboundEvent::Done { status } => {
                map.serialize_entry("status", status)?;
            }
        }
        map.end()
    }
}
