//! Pipeline stages
//!
//! A stage is one streaming call to a chat-completions service. Both pipeline
//! stages share the same runner; they differ only in their [`StageConfig`].
//!
//! [`StageConfig`]: crate::config::StageConfig

pub mod decoder;
mod error;
mod runner;

pub use decoder::{DataLine, LineDecoder, TokenDecoder, classify_line, token_stream};
pub use error::StageError;
#[cfg(test)]
pub use runner::mock;
pub use runner::{HttpStageRunner, StageRunner};
