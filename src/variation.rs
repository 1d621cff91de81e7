use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::bucket::BucketPrefix;
use crate::contexts::{Context, Kind, Reference};
use crate::error::EvalError;

pub type VariationIndex = usize;

// Stands in for a variation index that is not a non-negative integer. It never resolves to a
// variation, so evaluating it reports a malformed flag.
pub(crate) const INVALID_VARIATION_INDEX: VariationIndex = VariationIndex::MAX;

/// Reads a variation index, mapping negative, fractional and non-numeric values to an index that
/// is always out of range.
pub(crate) fn variation_index<'de, D>(deserializer: D) -> Result<VariationIndex, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Err(D::Error::custom("variation index is null")),
        value => Ok(value
            .as_u64()
            .and_then(|i| VariationIndex::try_from(i).ok())
            .unwrap_or(INVALID_VARIATION_INDEX)),
    }
}

pub(crate) fn optional_variation_index<'de, D>(
    deserializer: D,
) -> Result<Option<VariationIndex>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => Ok(Some(
            value
                .as_u64()
                .and_then(|i| VariationIndex::try_from(i).ok())
                .unwrap_or(INVALID_VARIATION_INDEX),
        )),
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct BucketResult {
    pub variation_index: VariationIndex,
    pub in_experiment: bool,
}

impl From<&VariationIndex> for BucketResult {
    fn from(variation_index: &VariationIndex) -> Self {
        BucketResult {
            variation_index: *variation_index,
            in_experiment: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

/// A percentage rollout across several variations.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "IntermediateRollout")]
pub struct Rollout {
    kind: RolloutKind,
    context_kind: Kind,
    bucket_by: Option<Reference>,
    variations: Vec<WeightedVariation>,
    seed: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntermediateRollout {
    #[serde(default)]
    kind: RolloutKind,
    #[serde(default)]
    context_kind: Option<Kind>,
    #[serde(default)]
    bucket_by: Option<String>,
    #[serde(default)]
    variations: Vec<WeightedVariation>,
    #[serde(default)]
    seed: Option<i64>,
}

impl From<IntermediateRollout> for Rollout {
    fn from(rollout: IntermediateRollout) -> Self {
        // Without a context kind, bucketBy is a plain attribute name rather than a path.
        let bucket_by = rollout.bucket_by.map(|by| match rollout.context_kind {
            Some(_) => Reference::new(by),
            None => Reference::literal(&by),
        });
        Rollout {
            kind: rollout.kind,
            context_kind: rollout.context_kind.unwrap_or_default(),
            bucket_by,
            variations: rollout.variations,
            seed: rollout.seed,
        }
    }
}

impl Rollout {
    #[cfg(test)]
    pub(crate) fn with_variations<V: Into<Vec<WeightedVariation>>>(variations: V) -> Self {
        Rollout {
            kind: RolloutKind::Rollout,
            context_kind: Kind::user(),
            bucket_by: None,
            variations: variations.into(),
            seed: None,
        }
    }
}

// Data errors may produce rules with neither or both of a variation and a rollout. Neither must
// not fail deserialization, and a variation wins over a rollout.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation {
        #[serde(deserialize_with = "variation_index")]
        variation: VariationIndex,
    },
    Rollout {
        rollout: Rollout,
    },
    Malformed(Value),
}

impl VariationOrRollout {
    pub(crate) fn missing() -> Self {
        VariationOrRollout::Malformed(Value::Null)
    }
}

pub(crate) type VariationWeight = f64;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WeightedVariation {
    #[serde(deserialize_with = "variation_index")]
    pub variation: VariationIndex,
    pub weight: VariationWeight,
    #[serde(default)]
    pub untracked: bool,
}

impl WeightedVariation {
    #[cfg(test)]
    pub(crate) fn new(variation: VariationIndex, weight: VariationWeight) -> Self {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    fn as_bucket_result(&self, in_experiment: bool) -> BucketResult {
        BucketResult {
            variation_index: self.variation,
            in_experiment: in_experiment && !self.untracked,
        }
    }
}

impl VariationOrRollout {
    /// Picks the variation for `context`. Rollouts hash the context into a bucket and walk the
    /// cumulative weights; if rounding leaves the bucket past the last boundary, the last
    /// variation is chosen.
    pub(crate) fn variation(
        &self,
        flag_key: &str,
        context: &Context,
        salt: &str,
    ) -> Result<BucketResult, EvalError> {
        let rollout = match self {
            VariationOrRollout::Variation { variation } => return Ok(variation.into()),
            VariationOrRollout::Rollout { rollout } => rollout,
            VariationOrRollout::Malformed(_) => return Err(EvalError::NoVariationOrRollout),
        };

        let last = rollout
            .variations
            .last()
            .ok_or(EvalError::NoVariationOrRollout)?;

        let is_experiment = rollout.kind == RolloutKind::Experiment;
        let prefix = match rollout.seed {
            Some(seed) => BucketPrefix::Seed(seed),
            None => BucketPrefix::KeyAndSalt(flag_key, salt),
        };

        let (bucket, had_context) = context.bucket(
            rollout.bucket_by.as_ref(),
            prefix,
            is_experiment,
            &rollout.context_kind,
        )?;
        let in_experiment = is_experiment && had_context;

        let mut sum = 0.0;
        for variation in &rollout.variations {
            sum += variation.weight / 100_000.0;
            if bucket < sum {
                return Ok(variation.as_bucket_result(in_experiment));
            }
        }
        Ok(last.as_bucket_result(in_experiment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContextBuilder;
    use spectral::prelude::*;

    fn user(key: &str) -> Context {
        ContextBuilder::new(key).build().unwrap()
    }

    #[test]
    fn parse_variation_or_rollout() {
        let variation: VariationOrRollout =
            serde_json::from_str(r#"{"variation":4}"#).expect("should parse");
        assert_that!(variation).is_equal_to(&VariationOrRollout::Variation { variation: 4 });

        let rollout: VariationOrRollout =
            serde_json::from_str(r#"{"rollout":{"variations":[{"variation":1,"weight":100000}]}}"#)
                .expect("should parse");
        assert_that!(rollout).is_equal_to(&VariationOrRollout::Rollout {
            rollout: Rollout::with_variations(vec![WeightedVariation::new(1, 100000.0)]),
        });

        let malformed: VariationOrRollout = serde_json::from_str(r#"{}"#).expect("should parse");
        assert_that!(malformed).is_equal_to(VariationOrRollout::Malformed(serde_json::json!({})));

        let overspecified: VariationOrRollout = serde_json::from_str(
            r#"{
                "variation": 1,
                "rollout": {"variations": [{"variation": 1, "weight": 100000}], "seed": 42}
            }"#,
        )
        .expect("should parse");
        assert_that!(overspecified).is_equal_to(VariationOrRollout::Variation { variation: 1 });
    }

    #[test]
    fn bucket_by_depends_on_context_kind() {
        let legacy: Rollout = serde_json::from_str(
            r#"{"bucketBy":"/attr","variations":[{"variation":0,"weight":100000}]}"#,
        )
        .unwrap();
        assert_eq!(legacy.bucket_by, Some(Reference::literal("/attr")));
        assert!(legacy.context_kind.is_user());

        let scoped: Rollout = serde_json::from_str(
            r#"{"contextKind":"org","bucketBy":"/attr","variations":[{"variation":0,"weight":100000}]}"#,
        )
        .unwrap();
        assert_eq!(scoped.bucket_by, Some(Reference::new("/attr")));
        assert_eq!(scoped.context_kind, "org");
    }

    #[test]
    fn invalid_indices_parse_out_of_range() {
        let negative: VariationOrRollout =
            serde_json::from_str(r#"{"variation":-1}"#).expect("should parse");
        assert_that!(negative).is_equal_to(VariationOrRollout::Variation {
            variation: INVALID_VARIATION_INDEX,
        });

        let text: WeightedVariation =
            serde_json::from_str(r#"{"variation":"one","weight":1}"#).expect("should parse");
        assert_eq!(text.variation, INVALID_VARIATION_INDEX);
    }

    #[test]
    fn variation_index_for_context() {
        const HASH_KEY: &str = "hashKey";
        const SALT: &str = "saltyA";

        let rollout = VariationOrRollout::Rollout {
            rollout: Rollout::with_variations(vec![
                WeightedVariation::new(0, 60_000.0),
                WeightedVariation::new(1, 40_000.0),
            ]),
        };

        asserting!("userKeyA (bucket 0.42157587) should get variation 0")
            .that(&rollout.variation(HASH_KEY, &user("userKeyA"), SALT))
            .is_ok_containing(BucketResult {
                variation_index: 0,
                in_experiment: false,
            });
        asserting!("userKeyB (bucket 0.6708485) should get variation 1")
            .that(&rollout.variation(HASH_KEY, &user("userKeyB"), SALT))
            .is_ok_containing(BucketResult {
                variation_index: 1,
                in_experiment: false,
            });
        asserting!("userKeyC (bucket 0.10343106) should get variation 0")
            .that(&rollout.variation(HASH_KEY, &user("userKeyC"), SALT))
            .is_ok_containing(BucketResult {
                variation_index: 0,
                in_experiment: false,
            });
    }

    #[test]
    fn variation_index_for_context_in_experiment() {
        let rollout = VariationOrRollout::Rollout {
            rollout: Rollout {
                seed: Some(61),
                kind: RolloutKind::Experiment,
                ..Rollout::with_variations(vec![
                    WeightedVariation::new(0, 10_000.0),
                    WeightedVariation::new(1, 20_000.0),
                    WeightedVariation {
                        variation: 0,
                        weight: 70_000.0,
                        untracked: true,
                    },
                ])
            },
        };

        asserting!("userKeyA (bucket 0.09801207) should get variation 0 and be in the experiment")
            .that(&rollout.variation("hashKey", &user("userKeyA"), "saltyA"))
            .is_ok_containing(BucketResult {
                variation_index: 0,
                in_experiment: true,
            });
        asserting!("userKeyB (bucket 0.14483777) should get variation 1 and be in the experiment")
            .that(&rollout.variation("hashKey", &user("userKeyB"), "saltyA"))
            .is_ok_containing(BucketResult {
                variation_index: 1,
                in_experiment: true,
            });
        asserting!("userKeyC (bucket 0.9242641) should get variation 0 outside the experiment")
            .that(&rollout.variation("hashKey", &user("userKeyC"), "saltyA"))
            .is_ok_containing(BucketResult {
                variation_index: 0,
                in_experiment: false,
            });
    }

    #[test]
    fn experiment_without_the_rollout_kind_is_not_in_experiment() {
        let rollout = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Experiment,
                context_kind: Kind::try_from("org").unwrap(),
                ..Rollout::with_variations(vec![WeightedVariation::new(0, 100_000.0)])
            },
        };
        assert_that!(rollout.variation("k", &user("u"), "s")).is_ok_containing(BucketResult {
            variation_index: 0,
            in_experiment: false,
        });
    }

    #[test]
    fn incomplete_weighting_defaults_to_last_variation() {
        let rollout = VariationOrRollout::Rollout {
            rollout: Rollout::with_variations(vec![
                WeightedVariation::new(0, 1.0),
                WeightedVariation::new(1, 2.0),
                WeightedVariation::new(2, 3.0),
            ]),
        };

        asserting!("userKeyD should get variation 2")
            .that(&rollout.variation("hashKey", &user("userKeyD"), "saltyA"))
            .is_ok_containing(BucketResult {
                variation_index: 2,
                in_experiment: false,
            });
    }

    #[test]
    fn empty_rollout_and_malformed_are_errors() {
        let empty = VariationOrRollout::Rollout {
            rollout: Rollout::with_variations(vec![]),
        };
        assert_that!(empty.variation("k", &user("u"), "s"))
            .is_err_containing(EvalError::NoVariationOrRollout);
        assert_that!(VariationOrRollout::missing().variation("k", &user("u"), "s"))
            .is_err_containing(EvalError::NoVariationOrRollout);
    }
}
