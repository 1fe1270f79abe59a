//! Progressive loading with placement fallback.
//!
//! [`ProgressiveLoader`] calls a caller-supplied load operation with the
//! planner's initial assignment. When an attempt fails with accelerator
//! memory exhaustion it asks the planner for the next tier and tries again;
//! any other failure is returned unchanged. Attempts never overlap.
//!
//! ```text
//! Planning ──▶ Attempting ──ok──▶ Succeeded
//!                 │  ▲
//!      recoverable│  │degrade() = Some
//!                 ▼  │
//!              classify ──fatal / degrade() = None──▶ Exhausted
//! ```

pub mod classify;

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::PlacementConfig;
use crate::placement::planner::Planner;
use crate::placement::{PlacementAssignment, Tier};

pub use classify::{classify, Classification, ResourceExhausted};

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RecoverableFailure,
    FatalFailure,
}

/// Record of one attempt within a loader invocation.
#[derive(Debug, Clone, Serialize)]
pub struct LoadAttempt {
    /// 1-based attempt number.
    pub number: u32,
    pub tier: Tier,
    pub assignment: PlacementAssignment,
    pub outcome: AttemptOutcome,
    /// Failure text with its full cause chain, when the attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LoadAttempt {
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// Result of a loader invocation together with its attempt history.
#[derive(Debug)]
pub struct LoadRun<T> {
    pub run_id: Uuid,
    pub result: Result<T>,
    pub attempts: Vec<LoadAttempt>,
}

/// Sequences load attempts, degrading placement after memory exhaustion.
#[derive(Debug, Clone)]
pub struct ProgressiveLoader {
    planner: Planner,
}

impl ProgressiveLoader {
    pub fn new(planner: Planner) -> Self {
        Self { planner }
    }

    /// Loader for the standard decoder layout sized by `config.layer_count`.
    pub fn for_config(config: &PlacementConfig) -> Self {
        Self::new(Planner::for_config(config))
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Load with `op`, retrying on accelerator memory exhaustion.
    ///
    /// Returns the first successful value. On failure the error is the one
    /// raised by the last attempt, unchanged, or a
    /// [`PlacementError`](crate::placement::PlacementError) when the
    /// configured device map is invalid (no attempt is made).
    pub fn load<T, F>(&self, config: &PlacementConfig, op: F) -> Result<T>
    where
        F: FnMut(&PlacementAssignment, &PlacementConfig) -> Result<T>,
    {
        self.load_traced(config, op).result
    }

    /// Like [`load`](Self::load), also returning the attempt history.
    pub fn load_traced<T, F>(&self, config: &PlacementConfig, mut op: F) -> LoadRun<T>
    where
        F: FnMut(&PlacementAssignment, &PlacementConfig) -> Result<T>,
    {
        let mut run = Run::new(&self.planner, config);
        let span = run.span();
        let _enter = span.enter();

        let mut assignment = match run.start() {
            Ok(assignment) => assignment,
            Err(e) => return run.finish(Err(e)),
        };

        loop {
            let started_at = Utc::now();
            match op(&assignment, config) {
                Ok(value) => {
                    run.succeeded(assignment, started_at);
                    return run.finish(Ok(value));
                }
                Err(failure) => match run.failed(assignment, started_at, failure) {
                    Next::Retry(next) => assignment = next,
                    Next::Abort(failure) => return run.finish(Err(failure)),
                },
            }
        }
    }

    /// Async form of [`load`](Self::load). `op` receives owned copies so its
    /// future may be moved onto a blocking pool; each future is awaited to
    /// completion before the next attempt is planned.
    pub async fn load_async<T, F, Fut>(&self, config: &PlacementConfig, op: F) -> Result<T>
    where
        F: FnMut(PlacementAssignment, PlacementConfig) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.load_async_traced(config, op).await.result
    }

    /// Async form of [`load_traced`](Self::load_traced).
    pub async fn load_async_traced<T, F, Fut>(&self, config: &PlacementConfig, mut op: F) -> LoadRun<T>
    where
        F: FnMut(PlacementAssignment, PlacementConfig) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut run = Run::new(&self.planner, config);
        let span = run.span();

        let result: Result<T> = async {
            let mut assignment = match run.start() {
                Ok(assignment) => assignment,
                Err(e) => return Err(e),
            };
            loop {
                let started_at = Utc::now();
                match op(assignment.clone(), config.clone()).await {
                    Ok(value) => {
                        run.succeeded(assignment, started_at);
                        return Ok(value);
                    }
                    Err(failure) => match run.failed(assignment, started_at, failure) {
                        Next::Retry(next) => assignment = next,
                        Next::Abort(failure) => return Err(failure),
                    },
                }
            }
        }
        .instrument(span)
        .await;

        run.finish(result)
    }
}

enum Next {
    Retry(PlacementAssignment),
    Abort(anyhow::Error),
}

/// State of one loader invocation.
struct Run<'a> {
    planner: &'a Planner,
    config: &'a PlacementConfig,
    run_id: Uuid,
    attempts: Vec<LoadAttempt>,
}

impl<'a> Run<'a> {
    fn new(planner: &'a Planner, config: &'a PlacementConfig) -> Self {
        Self {
            planner,
            config,
            run_id: Uuid::now_v7(),
            attempts: Vec::new(),
        }
    }

    fn span(&self) -> Span {
        info_span!(
            "load",
            run = %self.run_id,
            workload = %self.config.workload_identifier,
        )
    }

    fn start(&self) -> Result<PlacementAssignment> {
        let assignment = self.planner.initial_plan(self.config)?;
        debug!(plan = %assignment.summary(), "initial placement");
        Ok(assignment)
    }

    fn next_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    fn succeeded(&mut self, assignment: PlacementAssignment, started_at: DateTime<Utc>) {
        let number = self.next_number();
        info!(
            attempt = number,
            tier = %assignment.tier(),
            plan = %assignment.summary(),
            "workload loaded"
        );
        self.attempts.push(LoadAttempt {
            number,
            tier: assignment.tier(),
            assignment,
            outcome: AttemptOutcome::Success,
            failure: None,
            started_at,
            finished_at: Utc::now(),
        });
    }

    fn failed(
        &mut self,
        assignment: PlacementAssignment,
        started_at: DateTime<Utc>,
        failure: anyhow::Error,
    ) -> Next {
        let number = self.next_number();
        let classification = classify(&failure);
        let outcome = match classification {
            Classification::Recoverable => AttemptOutcome::RecoverableFailure,
            Classification::Fatal => AttemptOutcome::FatalFailure,
        };

        let next = match classification {
            Classification::Recoverable => self.planner.degrade(self.config, &assignment, number + 1),
            Classification::Fatal => None,
        };

        let from = assignment.tier();
        self.attempts.push(LoadAttempt {
            number,
            tier: from,
            assignment,
            outcome,
            failure: Some(format!("{failure:#}")),
            started_at,
            finished_at: Utc::now(),
        });

        match (classification, next) {
            (Classification::Fatal, _) => {
                error!(
                    attempt = number,
                    tier = %from,
                    error = %format!("{failure:#}"),
                    "load failed with a non-recoverable error, not retrying"
                );
                Next::Abort(failure)
            }
            (Classification::Recoverable, Some(next)) => {
                warn!(
                    attempt = number,
                    from = %from,
                    to = %next.tier(),
                    plan = %next.summary(),
                    reason = %failure,
                    "accelerator memory exhausted, falling back"
                );
                Next::Retry(next)
            }
            (Classification::Recoverable, None) => {
                error!(
                    attempts = self.attempts.len(),
                    history = %self.history(),
                    "all placement strategies exhausted"
                );
                Next::Abort(failure)
            }
        }
    }

    fn history(&self) -> String {
        self.attempts
            .iter()
            .map(|a| {
                format!(
                    "#{} {} [{}]: {}",
                    a.number,
                    a.tier(),
                    a.assignment.summary(),
                    a.failure.as_deref().unwrap_or("ok")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn finish<T>(self, result: Result<T>) -> LoadRun<T> {
        LoadRun {
            run_id: self.run_id,
            result,
            attempts: self.attempts,
        }
    }
}
