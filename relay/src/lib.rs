//! planrelay - two-stage streaming plan relay
//!
//! A client posts one query. The planner stage turns it into a terse
//! high-level plan; the executor stage turns that plan into a day-by-day
//! schedule. Both stages are streaming chat-completions calls, and every
//! token either of them produces is relayed to the client as it arrives.
//!
//! # Modules
//!
//! - [`stage`] - upstream stream decoding and the stage runner
//! - [`events`] - outbound event types
//! - [`sink`] - per-session frame channel
//! - [`pipeline`] - planner to executor orchestration
//! - [`server`] - HTTP front end
//! - [`directions`] - route lookup proxy
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface
//! - [`check`] - smoke-test client for a running server

pub mod check;
pub mod cli;
pub mod config;
pub mod directions;
pub mod events;
pub mod pipeline;
pub mod server;
pub mod sink;
pub mod stage;

pub use config::{Config, StageConfig};
pub use events::OutboundEvent;
pub use pipeline::{Pipeline, PipelineOutcome, PipelineState, Session};
pub use sink::{EventSink, SinkError};
pub use stage::{HttpStageRunner, StageError, StageRunner};
