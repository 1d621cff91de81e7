use futures::future::{BoxFuture, FutureExt};
use log::warn;
use serde::Deserialize;

use crate::big_segments::BigSegmentsStatus;
use crate::bucket::BucketPrefix;
use crate::contexts::{Context, Kind, Reference};
use crate::error::EvalError;
use crate::eval::{EvaluationState, Evaluator, EventFactory};
use crate::rule::Clause;
use crate::variation::VariationWeight;

/// Segment describes a group of contexts that flag rules can refer to with a segmentMatch clause.
///
/// A big segment (`unbounded`) keeps its membership in an external store, queried through
/// [crate::Store::big_segment_membership].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,

    #[serde(default)]
    pub unbounded: bool,
    #[serde(default)]
    unbounded_context_kind: Kind,
    #[serde(default)]
    generation: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SegmentTarget {
    #[serde(default)]
    context_kind: Kind,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "IntermediateSegmentRule")]
struct SegmentRule {
    id: String,
    clauses: Vec<Clause>,
    weight: Option<VariationWeight>,
    bucket_by: Option<Reference>,
    rollout_context_kind: Kind,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntermediateSegmentRule {
    #[serde(default)]
    id: String,
    #[serde(default)]
    clauses: Vec<Clause>,
    #[serde(default)]
    weight: Option<VariationWeight>,
    #[serde(default)]
    bucket_by: Option<String>,
    #[serde(default)]
    rollout_context_kind: Option<Kind>,
}

impl From<IntermediateSegmentRule> for SegmentRule {
    fn from(rule: IntermediateSegmentRule) -> Self {
        let bucket_by = rule.bucket_by.map(|by| match rule.rollout_context_kind {
            Some(_) => Reference::new(by),
            None => Reference::literal(&by),
        });
        SegmentRule {
            id: rule.id,
            clauses: rule.clauses,
            weight: rule.weight,
            bucket_by,
            rollout_context_kind: rule.rollout_context_kind.unwrap_or_default(),
        }
    }
}

impl SegmentTarget {
    fn contains(&self, context: &Context) -> bool {
        context
            .as_kind(&self.context_kind)
            .map_or(false, |c| self.values.iter().any(|value| value == c.key()))
    }
}

fn listed(user_keys: &[String], targets: &[SegmentTarget], context: &Context) -> bool {
    let user_listed = context
        .as_kind(&Kind::user())
        .map_or(false, |user| user_keys.iter().any(|key| key == user.key()));
    user_listed || targets.iter().any(|target| target.contains(context))
}

impl Segment {
    /// Explicit inclusion or exclusion of the context. Inclusion wins when both apply.
    fn explicit_membership(&self, context: &Context) -> Option<bool> {
        if listed(&self.included, &self.included_contexts, context) {
            Some(true)
        } else if listed(&self.excluded, &self.excluded_contexts, context) {
            Some(false)
        } else {
            None
        }
    }

    /// The name this segment has in big segment membership data.
    fn unbounded_segment_ref(&self, generation: i64) -> String {
        format!("{}.g{}", self.key, generation)
    }
}

impl SegmentRule {
    /// Whether the context falls within the rule's weight. Rules without a weight include every
    /// context their clauses match; a weight of zero or less includes none.
    fn weight_includes(&self, context: &Context, segment: &Segment) -> Result<bool, EvalError> {
        let weight = match self.weight {
            Some(weight) => weight,
            None => return Ok(true),
        };
        let prefix = BucketPrefix::KeyAndSalt(&segment.key, &segment.salt);
        let (bucket, _) = context.bucket(
            self.bucket_by.as_ref(),
            prefix,
            false,
            &self.rollout_context_kind,
        )?;
        Ok(bucket < weight / 100_000.0)
    }
}

impl<'a, F: EventFactory> Evaluator<'a, F> {
    /// Checks whether the context is in the segment with key `segment_key`. A segment missing from
    /// the store matches nothing.
    pub(crate) fn segment_match<'s>(
        &'s self,
        segment_key: &'a str,
        state: &'s mut EvaluationState<'a, F::Event>,
    ) -> BoxFuture<'s, Result<bool, EvalError>> {
        async move {
            let segment = match self.store.segment(segment_key) {
                Some(segment) => segment,
                None => {
                    warn!("segment {} not found", segment_key);
                    return Ok(false);
                }
            };

            if !state.segment_chain.insert(&segment.key) {
                warn!(
                    "segment rule referencing segment {} caused a circular reference; this is probably a temporary condition due to an incomplete update",
                    segment.key
                );
                return Err(EvalError::CircularSegment(segment.key.clone()));
            }

            let result = self.segment_contains(segment, state).await;
            state.segment_chain.remove(segment.key.as_str());
            result
        }
        .boxed()
    }

    async fn segment_contains(
        &self,
        segment: &'a Segment,
        state: &mut EvaluationState<'a, F::Event>,
    ) -> Result<bool, EvalError> {
        let membership = if segment.unbounded {
            self.big_segment_membership(segment, state).await
        } else {
            segment.explicit_membership(self.context)
        };

        match membership {
            Some(included) => Ok(included),
            None => self.segment_rules_match(segment, state).await,
        }
    }

    // None means the membership data says nothing about this segment.
    async fn big_segment_membership(
        &self,
        segment: &Segment,
        state: &mut EvaluationState<'a, F::Event>,
    ) -> Option<bool> {
        let generation = match segment.generation {
            Some(generation) => generation,
            None => {
                warn!("big segment {} has no generation", segment.key);
                state
                    .big_segments
                    .merge_status(BigSegmentsStatus::NotConfigured);
                return Some(false);
            }
        };

        let context = match self.context.as_kind(&segment.unbounded_context_kind) {
            Some(context) => context,
            None => return Some(false),
        };

        state
            .big_segments
            .membership(self.store, context.key())
            .await?
            .check(&segment.unbounded_segment_ref(generation))
    }

    async fn segment_rules_match(
        &self,
        segment: &'a Segment,
        state: &mut EvaluationState<'a, F::Event>,
    ) -> Result<bool, EvalError> {
        for rule in &segment.rules {
            if self.clauses_match(&rule.clauses, state).await?
                && rule.weight_includes(self.context, segment)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
