use std::collections::HashSet;

use futures::future::{BoxFuture, FutureExt};
use log::warn;
use serde::Serialize;
use serde_json::Value;

use crate::big_segments::{BigSegmentsState, BigSegmentsStatus};
use crate::contexts::Context;
use crate::error::EvalError;
use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::rule::Clause;
use crate::store::Store;
use crate::variation::{BucketResult, VariationIndex};

/// Builds the record kept for each prerequisite flag evaluated on the way to a result.
///
/// The evaluator never inspects these; they are handed back in [EvalResult::events], innermost
/// prerequisites first.
pub trait EventFactory: Sync {
    type Event: Send;

    fn prerequisite_event(
        &self,
        prerequisite_flag: &Flag,
        context: &Context,
        detail: &Detail<&FlagValue>,
        prerequisite_of: &Flag,
    ) -> Self::Event;
}

/// The results of an evaluation on a prerequisite flag.
#[derive(Clone, Debug)]
pub struct PrerequisiteEvent {
    /// The [crate::Flag::key] of the flag that depends on the prerequisite.
    pub target_flag_key: String,
    /// The [crate::Context] provided during the evaluation process.
    pub context: Context,
    /// The prerequisite [crate::Flag] that was evaluated.
    pub prerequisite_flag: Flag,
    /// The result of evaluating [PrerequisiteEvent::prerequisite_flag].
    pub prerequisite_result: Detail<FlagValue>,
}

/// An [EventFactory] producing [PrerequisiteEvent]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrerequisiteEventFactory;

impl EventFactory for PrerequisiteEventFactory {
    type Event = PrerequisiteEvent;

    fn prerequisite_event(
        &self,
        prerequisite_flag: &Flag,
        context: &Context,
        detail: &Detail<&FlagValue>,
        prerequisite_of: &Flag,
    ) -> PrerequisiteEvent {
        PrerequisiteEvent {
            target_flag_key: prerequisite_of.key.clone(),
            context: context.clone(),
            prerequisite_flag: prerequisite_flag.clone(),
            prerequisite_result: detail.clone().map(|value| value.clone()),
        }
    }
}

struct NoEvents;

impl EventFactory for NoEvents {
    type Event = ();

    fn prerequisite_event(&self, _: &Flag, _: &Context, _: &Detail<&FlagValue>, _: &Flag) {}
}

/// The outcome of one call to [evaluate] or [evaluate_with_events].
#[derive(Clone, Debug, PartialEq)]
pub struct EvalResult<'a, E = ()> {
    pub detail: Detail<&'a FlagValue>,
    /// Describes what went wrong when [EvalResult::detail] carries an error reason.
    pub message: Option<String>,
    /// Keys of the flag's prerequisites that were evaluated, in evaluation order.
    pub prerequisites: Vec<String>,
    /// One event per prerequisite evaluation, nested prerequisites first.
    pub events: Vec<E>,
    /// The merged status of every big segment query made, if any were needed.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl<'a, E> EvalResult<'a, E> {
    /// Builds a result for a failure detected before evaluation, such as an unknown flag key.
    pub fn for_error(error: Error, message: impl Into<String>) -> Self {
        EvalResult {
            detail: Detail::err(error),
            message: Some(message.into()),
            prerequisites: Vec::new(),
            events: Vec::new(),
            big_segments_status: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.detail.reason, Reason::Error { .. })
    }

    /// The reason as JSON, with `bigSegmentsStatus` attached when big segments were queried.
    pub fn reason_json(&self) -> Value {
        let mut json = serde_json::to_value(&self.detail.reason).unwrap_or(Value::Null);
        if let (Value::Object(fields), Some(status)) = (&mut json, self.big_segments_status) {
            fields.insert(
                "bigSegmentsStatus".to_string(),
                serde_json::to_value(status).unwrap_or(Value::Null),
            );
        }
        json
    }
}

/// Evaluate a feature flag for the specified [Context].
///
/// The evaluator does not know anything about analytics events; use [evaluate_with_events] to
/// also collect a record of each prerequisite evaluation.
pub async fn evaluate<'a>(
    store: &'a dyn Store,
    flag: &'a Flag,
    context: &'a Context,
) -> EvalResult<'a> {
    Evaluator::<NoEvents>::new(store, context, None)
        .run(flag)
        .await
}

/// Evaluate a feature flag for the specified [Context], asking `event_factory` for an event
/// each time a prerequisite flag is evaluated.
pub async fn evaluate_with_events<'a, F: EventFactory>(
    store: &'a dyn Store,
    flag: &'a Flag,
    context: &'a Context,
    event_factory: &'a F,
) -> EvalResult<'a, F::Event> {
    Evaluator::new(store, context, Some(event_factory))
        .run(flag)
        .await
}

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;
const PREALLOCATED_SEGMENT_CHAIN_SIZE: usize = 20;

/// Scratch state owned by a single evaluation.
pub(crate) struct EvaluationState<'a, E> {
    // Flags whose prerequisites are being resolved.
    prerequisite_chain: HashSet<&'a str>,
    // Segments whose rules are being matched.
    pub(crate) segment_chain: HashSet<&'a str>,
    pub(crate) big_segments: BigSegmentsState,
    events: Vec<E>,
}

impl<'a, E> EvaluationState<'a, E> {
    fn new() -> Self {
        Self {
            prerequisite_chain: HashSet::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
            segment_chain: HashSet::with_capacity(PREALLOCATED_SEGMENT_CHAIN_SIZE),
            big_segments: BigSegmentsState::default(),
            events: Vec::new(),
        }
    }
}

pub(crate) struct Evaluator<'a, F> {
    pub(crate) store: &'a dyn Store,
    pub(crate) context: &'a Context,
    event_factory: Option<&'a F>,
}

struct FlagOutcome<'a> {
    result: Result<Detail<&'a FlagValue>, EvalError>,
    // Prerequisites of this flag that were evaluated before a result was reached.
    prerequisites: Vec<&'a str>,
}

impl<'a, F: EventFactory> Evaluator<'a, F> {
    fn new(store: &'a dyn Store, context: &'a Context, event_factory: Option<&'a F>) -> Self {
        Evaluator {
            store,
            context,
            event_factory,
        }
    }

    async fn run(&self, flag: &'a Flag) -> EvalResult<'a, F::Event> {
        let mut state = EvaluationState::new();
        let FlagOutcome {
            result,
            prerequisites,
        } = self.evaluate_flag(flag, &mut state).await;

        let (detail, message) = match result {
            Ok(detail) => (detail, None),
            Err(e) => {
                warn!("flag {} could not be evaluated: {}", flag.key, e);
                (Detail::err(e.kind()), Some(e.to_string()))
            }
        };

        EvalResult {
            detail,
            message,
            prerequisites: prerequisites.into_iter().map(str::to_owned).collect(),
            events: state.events,
            big_segments_status: state.big_segments.status(),
        }
    }

    fn evaluate_flag<'s>(
        &'s self,
        flag: &'a Flag,
        state: &'s mut EvaluationState<'a, F::Event>,
    ) -> BoxFuture<'s, FlagOutcome<'a>> {
        async move {
            let mut prerequisites = Vec::new();
            let result = self
                .evaluate_flag_body(flag, state, &mut prerequisites)
                .await;
            FlagOutcome {
                result,
                prerequisites,
            }
        }
        .boxed()
    }

    async fn evaluate_flag_body(
        &self,
        flag: &'a Flag,
        state: &mut EvaluationState<'a, F::Event>,
        prerequisites: &mut Vec<&'a str>,
    ) -> Result<Detail<&'a FlagValue>, EvalError> {
        if !flag.on {
            return flag.off_value(Reason::Off);
        }

        if let Some(prerequisite_key) = self
            .check_prerequisites(flag, state, prerequisites)
            .await?
        {
            return flag.off_value(Reason::PrerequisiteFailed {
                prerequisite_key: prerequisite_key.to_string(),
            });
        }

        if let Some(variation_index) = flag.target_match(self.context) {
            return flag.variation(variation_index, Reason::TargetMatch);
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if self.clauses_match(&rule.clauses, state).await? {
                let BucketResult {
                    variation_index,
                    in_experiment,
                } = flag.resolve_variation_or_rollout(&rule.variation_or_rollout, self.context)?;
                let reason = Reason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                    in_experiment,
                };
                return flag.variation(variation_index, reason);
            }
        }

        let BucketResult {
            variation_index,
            in_experiment,
        } = flag.resolve_variation_or_rollout(&flag.fallthrough, self.context)?;
        flag.variation(variation_index, Reason::Fallthrough { in_experiment })
    }

    /// Returns the key of the first prerequisite that failed, if any.
    async fn check_prerequisites(
        &self,
        flag: &'a Flag,
        state: &mut EvaluationState<'a, F::Event>,
        prerequisites: &mut Vec<&'a str>,
    ) -> Result<Option<&'a str>, EvalError> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }

        state.prerequisite_chain.insert(flag.key.as_str());
        let result = self
            .first_failed_prerequisite(flag, state, prerequisites)
            .await;
        state.prerequisite_chain.remove(flag.key.as_str());
        result
    }

    async fn first_failed_prerequisite(
        &self,
        flag: &'a Flag,
        state: &mut EvaluationState<'a, F::Event>,
        prerequisites: &mut Vec<&'a str>,
    ) -> Result<Option<&'a str>, EvalError> {
        for prereq in &flag.prerequisites {
            if state.prerequisite_chain.contains(prereq.key.as_str()) {
                warn!(
                    "prerequisite relationship to {} caused a circular reference; this is probably a temporary condition due to an incomplete update",
                    prereq.key
                );
                return Err(EvalError::CircularPrerequisite(prereq.key.clone()));
            }

            let prereq_flag = match self.store.flag(&prereq.key) {
                Some(prereq_flag) => prereq_flag,
                None => {
                    warn!("prerequisite flag {} of {} not found", prereq.key, flag.key);
                    return Ok(Some(prereq.key.as_str()));
                }
            };

            let detail = match self.evaluate_flag(prereq_flag, state).await.result {
                Ok(detail) => detail,
                Err(e) if e.is_circular() => return Err(e),
                Err(e) => {
                    warn!(
                        "prerequisite flag {} of {} could not be evaluated: {}",
                        prereq.key, flag.key, e
                    );
                    Detail::err(e.kind())
                }
            };

            prerequisites.push(prereq.key.as_str());
            if let Some(event_factory) = self.event_factory {
                let event =
                    event_factory.prerequisite_event(prereq_flag, self.context, &detail, flag);
                state.events.push(event);
            }

            if !prereq_flag.on || detail.variation_index != Some(prereq.variation) {
                return Ok(Some(prereq.key.as_str()));
            }
        }

        Ok(None)
    }

    /// True if every clause matches. Stops at the first clause that does not.
    pub(crate) async fn clauses_match(
        &self,
        clauses: &'a [Clause],
        state: &mut EvaluationState<'a, F::Event>,
    ) -> Result<bool, EvalError> {
        for clause in clauses {
            if !self.clause_matches(clause, state).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clause_matches(
        &self,
        clause: &'a Clause,
        state: &mut EvaluationState<'a, F::Event>,
    ) -> Result<bool, EvalError> {
        if !clause.is_segment_match() {
            return clause.matches_non_segment(self.context);
        }

        let mut matched = false;
        for segment_key in clause.segment_keys() {
            if self.segment_match(segment_key, state).await? {
                matched = true;
                break;
            }
        }
        Ok(clause.maybe_negate(matched))
    }
}

/// A Detail combines the result of a flag evaluation with an explanation of how it was
/// calculated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The result of the flag evaluation. This will be either one of the flag's variations or None
    /// if no appropriate fallback value was configured.
    pub value: Option<T>,

    /// The index of the returned value within the flag's list of variations, e.g. 0 for the first
    /// variation. This is an Option because it is possible for the value to be undefined (there is
    /// no variation index if the application default value was returned due to an error in
    /// evaluation) which is different from a value of 0.
    pub variation_index: Option<VariationIndex>,

    /// A reason struct describing the main factor that influenced the flag evaluation value.
    pub reason: Reason,
}

impl<T> Detail<T> {
    /// Returns a detail with value and variation_index of None.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
        }
    }

    /// Returns a detail response using the provided default as the value and a variation_index
    /// of None.
    ///
    /// Callers use this when they detect an error themselves and fall back to the application's
    /// default value.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            variation_index: None,
            reason: Reason::Error { error },
        }
    }

    /// Returns a detail response using the provided error as the [Detail::reason].
    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// Returns a new instance of this detail with the provided function `f` applied to
    /// [Detail::value].
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    /// Set the [Detail::value] to `default` if it does not exist.
    ///
    /// The reason is left untouched.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }

    /// Like [Detail::or], computing the default only when it is needed.
    pub fn or_else<F>(mut self, default: F) -> Detail<T>
    where
        F: Fn() -> T,
    {
        if self.value.is_none() {
            self.value = Some(default());
            self.variation_index = None;
        }
        self
    }
}

/// Reason describes the reason that a flag evaluation produced a particular value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// Off indicates that the flag was off and therefore returned its configured off value.
    Off,
    /// TargetMatch indicates that context key was specifically targeted for this flag.
    TargetMatch,
    /// RuleMatch indicates that the context matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the [crate::FlagRule] that was matched.
        rule_index: usize,
        #[serde(skip_serializing_if = "String::is_empty")]
        /// The id property of the [crate::FlagRule::id] that was matched.
        rule_id: String,
        /// True if the variation was chosen by an experiment rollout and the selected variation
        /// is not untracked.
        #[serde(skip_serializing_if = "crate::util::is_false")]
        in_experiment: bool,
    },
    /// PrerequisiteFailed indicates that the flag was considered off because it had at
    /// least one prerequisite flag that either was off or did not return the desired variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// The key of the prerequisite flag that failed.
        prerequisite_key: String,
    },
    /// Fallthrough indicates that the flag was on but the context did not match any targets
    /// or rules.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        /// True if the variation was chosen by an experiment rollout and the selected variation
        /// is not untracked.
        #[serde(skip_serializing_if = "crate::util::is_false")]
        in_experiment: bool,
    },
    /// Error indicates that the flag could not be evaluated, e.g. because it does not
    /// exist or due to an unexpected error. In this case the result value will be the default value
    /// that the caller passed to the client.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    /// Whether the evaluation that produced this reason is part of an experiment.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            Reason::Fallthrough { in_experiment } => *in_experiment,
            _ => false,
        }
    }
}

/// Error is returned via a [Reason::Error] when the client could not evaluate a flag, and
/// provides information about why the flag could not be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// ClientNotReady indicates that the caller tried to evaluate a flag before the client
    /// had successfully initialized.
    ClientNotReady,
    /// FlagNotFound indicates that the caller provided a flag key that did not match any
    /// known flag.
    FlagNotFound,
    /// MalformedFlag indicates that there was an internal inconsistency in the flag data,
    /// e.g. a rule specified a nonexistent variation.
    MalformedFlag,
    /// UserNotSpecified indicates that the caller did not provide a usable context.
    UserNotSpecified,
    /// WrongType indicates that the result value was not of the requested type, e.g. you
    /// called BoolVariationDetail but the value was an integer.
    WrongType,
    /// Exception indicates that an unexpected error stopped flag evaluation; check the
    /// log for details.
    Exception,
}
