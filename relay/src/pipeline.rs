//! Two-stage pipeline orchestration
//!
//! The planner runs on the raw query; the executor runs on the planner's full
//! output plus the query. Each stage is bracketed by `_start` and `_done`
//! events, and every session ends with exactly one `done` or `error` event.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::StageConfig;
use crate::events::OutboundEvent;
use crate::sink::{EventSink, SinkError};
use crate::stage::{StageError, StageRunner};

/// Status text of the final `done` event
pub const COMPLETE_STATUS: &str = "Complete";

/// Where a session is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    PlannerRunning,
    PlannerDone,
    ExecutorRunning,
    Completed,
    Errored,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Errored)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::PlannerRunning => "planner-running",
            PipelineState::PlannerDone => "planner-done",
            PipelineState::ExecutorRunning => "executor-running",
            PipelineState::Completed => "completed",
            PipelineState::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

/// How a pipeline run ended, once its terminal event was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { plan: String, schedule: String },
    Failed { stage: String, message: String },
}

/// Per-request state; owned by the session task for its whole life
pub struct Session {
    query: String,
    plan: String,
    state: PipelineState,
    sink: EventSink,
}

impl Session {
    pub fn new(query: impl Into<String>, sink: EventSink) -> Self {
        Self {
            query: query.into(),
            plan: String::new(),
            state: PipelineState::Idle,
            sink,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Planner output; empty until the planner stage completes
    pub fn plan(&self) -> &str {
        &self.plan
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn sink(&mut self) -> &mut EventSink {
        &mut self.sink
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, "Session::transition");
        self.state = next;
    }
}

/// Build the executor's input from the plan and the original query
pub fn build_executor_prompt(plan: &str, query: &str) -> String {
    format!("High-level plan:\n{}\n\nOriginal rider request: {}", plan, query)
}

/// The planner → executor pipeline; shared read-only by all sessions
pub struct Pipeline {
    runner: Arc<dyn StageRunner>,
    planner: StageConfig,
    executor: StageConfig,
}

impl Pipeline {
    pub fn new(runner: Arc<dyn StageRunner>, planner: StageConfig, executor: StageConfig) -> Self {
        debug!(planner = ?planner, executor = ?executor, "Pipeline::new: called");
        Self {
            runner,
            planner,
            executor,
        }
    }

    pub fn planner(&self) -> &StageConfig {
        &self.planner
    }

    pub fn executor(&self) -> &StageConfig {
        &self.executor
    }

    /// Drive one session from `Idle` to a terminal state
    ///
    /// Stage failures are reported to the client as a single `error` event and
    /// returned as [`PipelineOutcome::Failed`]. An `Err` means the client could
    /// not be written to; in that case no terminal event may have been sent.
    pub async fn run(&self, session: &mut Session) -> Result<PipelineOutcome, SinkError> {
        debug!(query_len = session.query.len(), "Pipeline::run: called");

        session.transition(PipelineState::PlannerRunning);
        let planner = &self.planner;
        let query = session.query.clone();
        let plan = match self.run_stage(session, planner, &query).await? {
            Ok(plan) => plan,
            Err(message) => return self.fail(session, planner, message).await,
        };
        session.plan = plan;
        session.transition(PipelineState::PlannerDone);

        session.transition(PipelineState::ExecutorRunning);
        let executor = &self.executor;
        let prompt = build_executor_prompt(&session.plan, &session.query);
        let schedule = match self.run_stage(session, executor, &prompt).await? {
            Ok(schedule) => schedule,
            Err(message) => return self.fail(session, executor, message).await,
        };

        session.sink.send(&OutboundEvent::Done { status: COMPLETE_STATUS }).await?;
        session.transition(PipelineState::Completed);
        info!(
            plan_chars = session.plan.len(),
            schedule_chars = schedule.len(),
            "Pipeline::run: completed"
        );
        Ok(PipelineOutcome::Completed {
            plan: session.plan.clone(),
            schedule,
        })
    }

    // Runs one stage between its `_start` and `_done` events. The outer
    // result is a client write failure; the inner one is the stage's own
    // outcome, with failures already rendered for the client.
    async fn run_stage(
        &self,
        session: &mut Session,
        stage: &StageConfig,
        prompt: &str,
    ) -> Result<Result<String, String>, SinkError> {
        session
            .sink
            .send(&OutboundEvent::StageStart {
                stage: &stage.name,
                status: &stage.start_status,
            })
            .await?;

        match self.runner.run(stage, prompt, &mut session.sink).await {
            Ok(text) => {
                session
                    .sink
                    .send(&OutboundEvent::StageDone {
                        stage: &stage.name,
                        output_field: &stage.output_field,
                        text: &text,
                        status: &stage.done_status,
                    })
                    .await?;
                Ok(Ok(text))
            }
            Err(StageError::Sink(e)) => Err(e),
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "Pipeline::run_stage: stage failed");
                Ok(Err(format!("{} failed: {}", capitalize(&stage.name), e)))
            }
        }
    }

    async fn fail(
        &self,
        session: &mut Session,
        stage: &StageConfig,
        message: String,
    ) -> Result<PipelineOutcome, SinkError> {
        session.sink.send(&OutboundEvent::Error { status: &message }).await?;
        session.transition(PipelineState::Errored);
        Ok(PipelineOutcome::Failed {
            stage: stage.name.clone(),
            message,
        })
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
