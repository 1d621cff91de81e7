use chrono::{DateTime, Utc};
use log::{error, warn};
use regex::Regex;
use serde::Deserialize;

use crate::attribute_value::AttributeValue;
use crate::contexts::{Context, Kind, Reference};
use crate::error::EvalError;
use crate::variation::VariationOrRollout;

/// A single condition within a flag or segment rule.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "IntermediateClause")]
pub struct Clause {
    context_kind: Kind,
    attribute: Reference,
    negate: bool,
    op: Op,
    values: Vec<AttributeValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntermediateClause {
    #[serde(default)]
    context_kind: Option<Kind>,
    #[serde(default)]
    attribute: String,
    #[serde(default)]
    negate: bool,
    op: Op,
    #[serde(default)]
    values: Vec<AttributeValue>,
}

impl From<IntermediateClause> for Clause {
    fn from(clause: IntermediateClause) -> Self {
        // Clauses written before context kinds existed name a top-level attribute literally.
        let attribute = match clause.context_kind {
            Some(_) => Reference::new(clause.attribute),
            None => Reference::literal(&clause.attribute),
        };
        Clause {
            context_kind: clause.context_kind.unwrap_or_default(),
            attribute,
            negate: clause.negate,
            op: clause.op,
            values: clause.values,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub(crate) clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
    #[serde(other)]
    Unknown,
}

impl Clause {
    pub(crate) fn is_segment_match(&self) -> bool {
        self.op == Op::SegmentMatch
    }

    /// The segment keys named by a segmentMatch clause.
    pub(crate) fn segment_keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(AttributeValue::as_str)
    }

    pub(crate) fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    /// Matches every operator except segmentMatch, which needs the segment store.
    ///
    /// An absent attribute or an unrecognized operator never matches, negated or not.
    pub(crate) fn matches_non_segment(&self, context: &Context) -> Result<bool, EvalError> {
        if self.op == Op::Unknown {
            warn!("clause has an unrecognized operator; treating it as a non-match");
            return Ok(false);
        }

        if let Some(e) = self.attribute.error() {
            return Err(EvalError::InvalidAttributeReference {
                reference: self.attribute.to_string(),
                reason: e.to_string(),
            });
        }

        if self.attribute.is_kind() {
            let any_match = context
                .kinds()
                .into_iter()
                .any(|kind| self.matches_any(&AttributeValue::String(kind.to_string())));
            return Ok(self.maybe_negate(any_match));
        }

        let value = match context
            .as_kind(&self.context_kind)
            .and_then(|c| c.get_value(&self.attribute))
        {
            Some(value) if !value.is_null() => value,
            _ => return Ok(false),
        };

        Ok(self.maybe_negate(value.any(|v| self.matches_any(v))))
    }

    fn matches_any(&self, context_value: &AttributeValue) -> bool {
        self.values
            .iter()
            .any(|clause_value| self.op.matches(context_value, clause_value))
    }
}

impl Op {
    fn matches(&self, lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
        match self {
            Op::In => lhs == rhs,

            // string ops
            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::Matches => string_op(lhs, rhs, |l, r| match Regex::new(r) {
                Ok(re) => re.is_match(l),
                Err(e) => {
                    warn!("invalid regex for 'matches' operator ({}): {}", e, r);
                    false
                }
            }),

            // numeric ops
            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),

            Op::Before => time_op(lhs, rhs, |l, r| l < r),
            Op::After => time_op(lhs, rhs, |l, r| l > r),

            Op::SemVerEqual => semver_op(lhs, rhs, |l, r| l == r),
            Op::SemVerLessThan => semver_op(lhs, rhs, |l, r| l < r),
            Op::SemVerGreaterThan => semver_op(lhs, rhs, |l, r| l > r),

            Op::SegmentMatch => {
                error!("segmentMatch operator should be special-cased, shouldn't get here");
                false
            }
            Op::Unknown => false,
        }
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn time_op<F: Fn(DateTime<Utc>, DateTime<Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.to_datetime(), rhs.to_datetime()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn semver_op<F: Fn(semver::Version, semver::Version) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.as_semver(), rhs.as_semver()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

#[cfg(test)]
impl Clause {
    pub(crate) fn new_match(attribute: &str, value: AttributeValue, kind: Kind) -> Self {
        Clause {
            context_kind: kind,
            attribute: Reference::new(attribute),
            negate: false,
            op: Op::In,
            values: vec![value],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use maplit::hashmap;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    use super::*;
    use crate::{ContextBuilder, MultiContextBuilder};

    fn astring(s: &str) -> AttributeValue {
        AttributeValue::String(s.into())
    }
    fn afloat(f: f64) -> AttributeValue {
        AttributeValue::Number(f)
    }

    #[test]
    fn test_op_in() {
        assert!(Op::In.matches(&astring("foo"), &astring("foo")));
        assert!(!Op::In.matches(&astring("foo"), &astring("bar")));
        assert!(
            !Op::In.matches(&astring("Foo"), &astring("foo")),
            "case sensitive"
        );

        assert!(Op::In.matches(&afloat(42.0), &afloat(42.0)));
        assert!(!Op::In.matches(&afloat(42.0), &afloat(3.0)));
        assert!(Op::In.matches(&afloat(0.0), &afloat(-0.0)));
        assert!(
            !Op::In.matches(&afloat(1.0), &astring("1")),
            "no conversion between types"
        );
    }

    #[test_case(Op::StartsWith, "food", "foo", true)]
    #[test_case(Op::StartsWith, "foo", "food", false)]
    #[test_case(Op::StartsWith, "Food", "foo", false)]
    #[test_case(Op::EndsWith, "food", "ood", true)]
    #[test_case(Op::EndsWith, "ood", "food", false)]
    #[test_case(Op::EndsWith, "FOOD", "ood", false)]
    #[test_case(Op::Contains, "food", "oo", true)]
    #[test_case(Op::Contains, "oo", "food", false)]
    #[test_case(Op::Contains, "FOOD", "oo", false)]
    #[test_case(Op::Contains, "a", "", true)]
    fn test_string_ops(op: Op, lhs: &str, rhs: &str, expected: bool) {
        assert_eq!(op.matches(&astring(lhs), &astring(rhs)), expected);
    }

    #[test]
    fn test_string_ops_need_strings() {
        assert!(!Op::StartsWith.matches(&afloat(12.0), &astring("1")));
        assert!(!Op::Contains.matches(&astring("12"), &afloat(1.0)));
    }

    #[test]
    fn test_op_matches() {
        fn should_match(text: &str, pattern: &str) {
            assert!(
                Op::Matches.matches(&astring(text), &astring(pattern)),
                "`{}` should match `{}`",
                text,
                pattern
            );
        }

        fn should_not_match(text: &str, pattern: &str) {
            assert!(
                !Op::Matches.matches(&astring(text), &astring(pattern)),
                "`{}` should not match `{}`",
                text,
                pattern
            );
        }

        should_match("", "");
        should_match("a", "");
        should_match("a", ".");
        should_match("hello world", "hello.*rld");
        should_match("hello world", "l+");
        should_match("hello world", "(world|planet)");

        should_not_match("", ".");
        should_not_match("", r"\");
        should_not_match("hello world", "aloha");
        should_not_match("hello world", "***bad regex");
    }

    #[test]
    fn test_ops_numeric() {
        assert!(Op::LessThan.matches(&afloat(0.0), &afloat(1.0)));
        assert!(!Op::LessThan.matches(&afloat(0.0), &afloat(0.0)));
        assert!(Op::LessThanOrEqual.matches(&afloat(0.0), &afloat(0.0)));
        assert!(!Op::LessThanOrEqual.matches(&afloat(1.0), &afloat(0.0)));
        assert!(Op::GreaterThan.matches(&afloat(1.0), &afloat(0.0)));
        assert!(!Op::GreaterThan.matches(&afloat(0.0), &afloat(0.0)));
        assert!(Op::GreaterThanOrEqual.matches(&afloat(0.0), &afloat(0.0)));
        assert!(!Op::GreaterThanOrEqual.matches(&afloat(0.0), &afloat(1.0)));

        assert!(
            !Op::LessThan.matches(&astring("0"), &afloat(1.0)),
            "numeric strings are not numbers"
        );
    }

    #[test]
    fn test_ops_time() {
        let today_millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as f64;
        let yesterday_millis = today_millis - 86_400_000_f64;

        assert!(Op::Before.matches(&afloat(yesterday_millis), &afloat(today_millis)));
        assert!(!Op::Before.matches(&afloat(today_millis), &afloat(yesterday_millis)));
        assert!(!Op::Before.matches(&afloat(today_millis), &afloat(today_millis)));
        assert!(Op::After.matches(&afloat(today_millis), &afloat(yesterday_millis)));
        assert!(!Op::After.matches(&afloat(today_millis), &afloat(today_millis)));

        assert!(Op::Before.matches(
            &astring("2019-11-19T17:29:00.000000-07:00"),
            &afloat(today_millis)
        ));
        assert!(
            Op::Before.matches(&astring("2019-11-19T17:29:00-07:00"), &afloat(today_millis)),
            "fractional seconds part is optional"
        );
        assert!(Op::After.matches(
            &afloat(today_millis),
            &astring("2019-11-19T17:29:00.000000-07:00")
        ));

        assert!(!Op::Before.matches(&astring("fish"), &afloat(today_millis)));
        assert!(!Op::After.matches(&afloat(today_millis), &astring("fish")));
    }

    #[test]
    fn test_semver_ops() {
        assert!(Op::SemVerEqual.matches(&astring("2.0.0"), &astring("2.0.0")));
        assert!(
            Op::SemVerEqual.matches(&astring("2.0"), &astring("2.0.0")),
            "missing components are filled in with zeroes"
        );
        assert!(Op::SemVerEqual.matches(&astring("2"), &astring("2.0.0")));
        assert!(!Op::SemVerEqual.matches(&astring("2.0.0"), &astring("2.0.1")));

        assert!(Op::SemVerGreaterThan.matches(&astring("2.1.0"), &astring("2.0.0")));
        assert!(Op::SemVerGreaterThan
            .matches(&astring("2.0.0-rc.10.green"), &astring("2.0.0-rc.2.green")));
        assert!(
            !Op::SemVerGreaterThan.matches(&astring("2.0.0-rc"), &astring("2.0.0")),
            "prerelease version < released version"
        );
        assert!(
            !Op::SemVerGreaterThan.matches(&astring("2.0.0+build"), &astring("2.0.0")),
            "build metadata is ignored"
        );
        assert!(Op::SemVerLessThan.matches(&astring("1.9.9"), &astring("2.0.0")));

        assert!(!Op::SemVerEqual.matches(&astring("2.0.0"), &afloat(2.0)));
    }

    #[test_case(false; "plain")]
    #[test_case(true; "negated")]
    fn unknown_operators_parse_and_never_match(negate: bool) {
        let clause: Clause = serde_json::from_value(json!({
            "attribute": "key", "op": "someFutureOp", "values": ["a"], "negate": negate
        }))
        .unwrap();
        assert_eq!(clause.op, Op::Unknown);
        let matching_key = ContextBuilder::new("a").build().unwrap();
        let other_key = ContextBuilder::new("b").build().unwrap();
        assert_that!(clause.matches_non_segment(&matching_key)).is_ok_containing(false);
        assert_that!(clause.matches_non_segment(&other_key)).is_ok_containing(false);
    }

    fn clause(value: serde_json::Value) -> Clause {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_clause_matches() {
        let one_val = clause(json!({"attribute": "a", "op": "in", "values": ["foo"]}));
        let many_val = clause(json!({"attribute": "a", "op": "in", "values": ["foo", "bar"]}));
        let negated = clause(json!({"attribute": "a", "op": "in", "values": ["foo"], "negate": true}));

        let matching = ContextBuilder::new("mc").set_string("a", "foo").build().unwrap();
        let other = ContextBuilder::new("oc").set_string("a", "bar").build().unwrap();
        let without_attr = ContextBuilder::new("wa").build().unwrap();

        assert_that!(one_val.matches_non_segment(&matching)).is_ok_containing(true);
        assert_that!(one_val.matches_non_segment(&other)).is_ok_containing(false);
        assert_that!(many_val.matches_non_segment(&other)).is_ok_containing(true);

        assert_that!(negated.matches_non_segment(&matching)).is_ok_containing(false);
        assert_that!(negated.matches_non_segment(&other)).is_ok_containing(true);
        asserting!("a missing attribute does not match even when negated")
            .that(&negated.matches_non_segment(&without_attr))
            .is_ok_containing(false);
    }

    #[test]
    fn array_attributes_match_any_element() {
        let c = clause(json!({"attribute": "groups", "op": "in", "values": ["beta"]}));
        let context = ContextBuilder::new("k")
            .set_value("groups", AttributeValue::from(vec!["alpha", "beta"]))
            .build()
            .unwrap();
        assert_that!(c.matches_non_segment(&context)).is_ok_containing(true);
    }

    #[test]
    fn clauses_are_scoped_by_context_kind() {
        let c = clause(json!({"contextKind": "org", "attribute": "key", "op": "in", "values": ["o"]}));
        let user = ContextBuilder::new("o").build().unwrap();
        let org = ContextBuilder::new("o").kind("org").build().unwrap();
        let multi = MultiContextBuilder::new()
            .add_context(user.clone())
            .add_context(org.clone())
            .build()
            .unwrap();

        assert_that!(c.matches_non_segment(&user)).is_ok_containing(false);
        assert_that!(c.matches_non_segment(&org)).is_ok_containing(true);
        assert_that!(c.matches_non_segment(&multi)).is_ok_containing(true);
    }

    #[test]
    fn kind_clauses_match_any_kind_present() {
        let c = clause(json!({"contextKind": "user", "attribute": "kind", "op": "in", "values": ["org"]}));
        let multi = MultiContextBuilder::new()
            .add_context(ContextBuilder::new("u").build().unwrap())
            .add_context(ContextBuilder::new("o").kind("org").build().unwrap())
            .build()
            .unwrap();
        let user = ContextBuilder::new("u").build().unwrap();

        assert_that!(c.matches_non_segment(&multi)).is_ok_containing(true);
        assert_that!(c.matches_non_segment(&user)).is_ok_containing(false);
    }

    #[test]
    fn legacy_attribute_names_are_literal() {
        let c = clause(json!({"attribute": "/slashed", "op": "in", "values": ["x"]}));
        let context = ContextBuilder::new("k")
            .set_string("/slashed", "x")
            .build()
            .unwrap();
        assert_that!(c.matches_non_segment(&context)).is_ok_containing(true);
    }

    #[test]
    fn nested_attributes_can_be_addressed_with_a_context_kind() {
        let c = clause(json!({"contextKind": "user", "attribute": "/address/city", "op": "in", "values": ["Oslo"]}));
        let context = ContextBuilder::new("k")
            .set_value(
                "address",
                AttributeValue::Object(hashmap! {"city".to_string() => astring("Oslo")}),
            )
            .build()
            .unwrap();
        assert_that!(c.matches_non_segment(&context)).is_ok_containing(true);
    }

    #[test]
    fn invalid_references_are_errors() {
        let c = clause(json!({"contextKind": "user", "attribute": "/", "op": "in", "values": ["x"]}));
        let context = ContextBuilder::new("k").build().unwrap();
        assert!(matches!(
            c.matches_non_segment(&context),
            Err(EvalError::InvalidAttributeReference { .. })
        ));

        let empty = clause(json!({"attribute": "", "op": "in", "values": ["x"]}));
        assert!(empty.matches_non_segment(&context).is_err());
    }
}
