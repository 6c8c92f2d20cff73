//! Contracts for the external collaborators the pipeline calls.
//!
//! Ownership model:
//! - `PatternLearner` turns labeled examples into symbolic patterns.
//! - `TextGenerator` produces one counterfactual text per call.
//! - `TextScorer` answers pattern-consistency and label-flip questions.
//! - `TextEmbedder` optionally backs embedding-based similarity.
//!
//! Every call may fail per-call (`CapabilityError::Failed`/`Timeout`), which the
//! pipeline absorbs, or report `CapabilityError::Unavailable`, which aborts the run.

use std::sync::{Arc, Condvar, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::data::{LabeledExample, Pattern};
use crate::errors::CapabilityError;
use crate::types::Label;

/// Everything a generator needs to produce one counterfactual.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    /// Text of the seed being rewritten.
    pub seed_text: String,
    /// Label of the seed.
    pub original_label: Label,
    /// Label the rewrite should express.
    pub target_label: Label,
    /// Guiding pattern; `None` selects the general-edit strategy.
    pub pattern: Option<Pattern>,
    /// Candidate slot within the seed.
    pub slot: usize,
    /// Zero-based attempt for this slot.
    pub attempt: u32,
}

/// Primary and soft label-flip scores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlipScores {
    /// Likelihood the text now carries the target label.
    pub primary: f32,
    /// Likelihood the original label's semantics were removed.
    pub soft: f32,
}

impl FlipScores {
    /// Scores as returned by the scorer.
    pub fn new(primary: f32, soft: f32) -> Self {
        Self { primary, soft }
    }
}

/// One candidate's scoring questions, answerable in a single batched call.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreRequest<'a> {
    /// Candidate text.
    pub text: &'a str,
    /// Guiding pattern, if the candidate has one.
    pub pattern: Option<&'a Pattern>,
    /// Seed label.
    pub from_label: &'a str,
    /// Target label.
    pub to_label: &'a str,
}

/// Answers to a `ScoreRequest`.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchScores {
    /// `None` when the request carried no pattern.
    pub pattern_match: Option<Result<f32, CapabilityError>>,
    /// Label-flip scores.
    pub label_flip: Result<FlipScores, CapabilityError>,
}

/// Learns symbolic patterns for one label.
pub trait PatternLearner: Send + Sync {
    /// Return zero or more patterns for `label` learned from `examples`.
    fn learn(&self, label: &str, examples: &[LabeledExample])
    -> Result<Vec<Pattern>, CapabilityError>;
}

/// Produces counterfactual text.
pub trait TextGenerator: Send + Sync {
    /// Produce one counterfactual for `context`.
    fn generate(&self, context: &GenerationContext) -> Result<String, CapabilityError>;
}

/// Scores candidate texts for the C2 and C3 gates.
pub trait TextScorer: Send + Sync {
    /// Pattern-consistency score in [0, 1].
    fn pattern_match(&self, text: &str, pattern: &Pattern) -> Result<f32, CapabilityError>;

    /// Label-flip scores in [0, 1].
    fn label_flip(
        &self,
        text: &str,
        from_label: &str,
        to_label: &str,
    ) -> Result<FlipScores, CapabilityError>;

    /// Answer every question for one candidate at once.
    ///
    /// Backends with a combined endpoint override this; the default issues the
    /// individual calls so results are identical either way.
    fn score_all(&self, request: &ScoreRequest<'_>) -> BatchScores {
        BatchScores {
            pattern_match: request
                .pattern
                .map(|pattern| self.pattern_match(request.text, pattern)),
            label_flip: self.label_flip(request.text, request.from_label, request.to_label),
        }
    }
}

/// Embeds texts into dense vectors.
pub trait TextEmbedder: Send + Sync {
    /// One vector per text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError>;
}

/// Caps collaborator calls in flight.
///
/// A call abandoned after its timeout keeps its slot until it actually returns,
/// so a hung backend never sees more than `limit` concurrent calls.
#[derive(Debug)]
pub struct CallLimiter {
    limit: usize,
    in_flight: Mutex<usize>,
    released: Condvar,
}

impl CallLimiter {
    /// Limiter admitting at most `limit` calls at once (at least one).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Maximum concurrent calls.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Calls currently holding a slot, including abandoned ones still running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `call` once a slot is free, bounded by `timeout`.
    ///
    /// Waiting for a slot counts against `timeout`. A zero `timeout` waits for a
    /// slot indefinitely and runs the call inline. A timed-out call keeps running
    /// on its helper thread; its result is dropped.
    pub fn call<T, F>(self: &Arc<Self>, timeout: Duration, call: F) -> Result<T, CapabilityError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CapabilityError> + Send + 'static,
    {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let Some(permit) = self.acquire(deadline) else {
            return Err(CapabilityError::Timeout(timeout));
        };
        let Some(deadline) = deadline else {
            let result = call();
            drop(permit);
            return result;
        };
        let (sender, receiver) = mpsc::sync_channel(1);
        thread::spawn(move || {
            let result = call();
            drop(permit);
            let _ = sender.send(result);
        });
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CapabilityError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CapabilityError::Failed(
                "collaborator call panicked".to_string(),
            )),
        }
    }

    fn acquire(self: &Arc<Self>, deadline: Option<Instant>) -> Option<CallPermit> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_flight >= self.limit {
            in_flight = match deadline {
                None => self
                    .released
                    .wait(in_flight)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return None;
                    }
                    self.released
                        .wait_timeout(in_flight, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *in_flight += 1;
        Some(CallPermit {
            limiter: Arc::clone(self),
        })
    }
}

impl Default for CallLimiter {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Slot held for the lifetime of one collaborator call.
struct CallPermit {
    limiter: Arc<CallLimiter>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let mut in_flight = self
            .limiter
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *in_flight = in_flight.saturating_sub(1);
        self.limiter.released.notify_one();
    }
}
