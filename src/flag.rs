use serde::Deserialize;

use crate::contexts::{Context, Kind};
use crate::error::EvalError;
use crate::eval::{Detail, Reason};
use crate::flag_value::FlagValue;
use crate::rule::FlagRule;
use crate::variation::{
    optional_variation_index, variation_index, BucketResult, VariationIndex, VariationOrRollout,
};

/// Flag describes an individual feature flag.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub(crate) on: bool,

    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    #[serde(default)]
    pub(crate) context_targets: Vec<Target>,
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    #[serde(default = "VariationOrRollout::missing")]
    pub(crate) fallthrough: VariationOrRollout,
    #[serde(default, deserialize_with = "optional_variation_index")]
    pub(crate) off_variation: Option<VariationIndex>,
    #[serde(default)]
    variations: Vec<FlagValue>,

    #[serde(default)]
    salt: String,

    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
    #[serde(default)]
    pub sampling_ratio: Option<u32>,
    #[serde(default)]
    pub exclude_from_summaries: bool,
}

/// A prerequisite flag and the variation it must evaluate to.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Prereq {
    pub(crate) key: String,
    #[serde(deserialize_with = "variation_index")]
    pub(crate) variation: VariationIndex,
}

/// Context keys that are served a specific variation. Legacy targets have no context kind and
/// apply to users.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Target {
    #[serde(default)]
    pub(crate) context_kind: Kind,
    #[serde(default)]
    pub(crate) values: Vec<String>,
    #[serde(deserialize_with = "variation_index")]
    pub(crate) variation: VariationIndex,
}

impl Target {
    pub(crate) fn matches(&self, context: &Context) -> bool {
        context
            .as_kind(&self.context_kind)
            .map_or(false, |c| self.values.iter().any(|value| value == c.key()))
    }
}

impl Flag {
    /// Returns the detail for the variation at `index`, or an error if the flag has no such
    /// variation.
    pub fn variation(
        &self,
        index: VariationIndex,
        reason: Reason,
    ) -> Result<Detail<&FlagValue>, EvalError> {
        match self.variations.get(index) {
            Some(value) => Ok(Detail {
                value: Some(value),
                variation_index: Some(index),
                reason,
            }),
            None => Err(EvalError::InvalidVariationIndex {
                index,
                count: self.variations.len(),
            }),
        }
    }

    /// Returns the off variation, or an empty detail if the flag has none.
    pub fn off_value(&self, reason: Reason) -> Result<Detail<&FlagValue>, EvalError> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Ok(Detail::empty(reason)),
        }
    }

    /// Finds the variation the context is individually targeted with, if any.
    ///
    /// When the flag has context targets, they are checked in order. A user-kind context target
    /// without values stands in for the legacy user targets of the same variation.
    pub(crate) fn target_match(&self, context: &Context) -> Option<VariationIndex> {
        if self.context_targets.is_empty() {
            return self
                .targets
                .iter()
                .find(|target| target.matches(context))
                .map(|target| target.variation);
        }

        self.context_targets.iter().find_map(|context_target| {
            if context_target.context_kind.is_user() && context_target.values.is_empty() {
                self.targets
                    .iter()
                    .filter(|target| target.variation == context_target.variation)
                    .find(|target| target.matches(context))
                    .map(|target| target.variation)
            } else if context_target.matches(context) {
                Some(context_target.variation)
            } else {
                None
            }
        })
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRollout,
        context: &Context,
    ) -> Result<BucketResult, EvalError> {
        vr.variation(&self.key, context, &self.salt)
    }

    /// Whether an evaluation with the given reason should produce full analytics events.
    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            _ if reason.is_in_experiment() => true,
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }
}
