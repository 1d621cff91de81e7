use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::store::Store;

/// BigSegmentsStatus describes how trustworthy the big segment data used by an evaluation was.
///
/// When an evaluation queries big segment membership more than once, the statuses are merged and
/// the least healthy one is reported, in the order of the variants below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// The membership store was queried successfully and its data is up to date.
    Healthy,
    /// The membership store answered, but its data may be out of date.
    Stale,
    /// The membership store could not be queried.
    StoreError,
    /// Big segments are not configured, or a big segment has no generation.
    NotConfigured,
}

impl BigSegmentsStatus {
    pub fn merge(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        self.max(other)
    }
}

/// The big segments a single context key belongs to, as reported by the membership store.
///
/// Keys are segment references of the form `<segment key>.g<generation>`. `true` means the
/// context is included, `false` that it is excluded; a missing reference means neither.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BigSegmentMembership(HashMap<String, bool>);

impl BigSegmentMembership {
    pub fn new(memberships: HashMap<String, bool>) -> Self {
        BigSegmentMembership(memberships)
    }

    pub fn check(&self, segment_ref: &str) -> Option<bool> {
        self.0.get(segment_ref).copied()
    }
}

impl From<HashMap<String, bool>> for BigSegmentMembership {
    fn from(memberships: HashMap<String, bool>) -> Self {
        BigSegmentMembership::new(memberships)
    }
}

impl FromIterator<(String, bool)> for BigSegmentMembership {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        BigSegmentMembership(iter.into_iter().collect())
    }
}

/// The answer to a single membership query.
#[derive(Clone, Debug, PartialEq)]
pub struct BigSegmentMembershipResult {
    /// None when the store has no data for the context key.
    pub membership: Option<BigSegmentMembership>,
    pub status: BigSegmentsStatus,
}

/// Memoized membership queries and the merged status for one evaluation.
#[derive(Debug, Default)]
pub(crate) struct BigSegmentsState {
    memberships: HashMap<String, Option<BigSegmentMembership>>,
    status: Option<BigSegmentsStatus>,
}

impl BigSegmentsState {
    pub(crate) fn status(&self) -> Option<BigSegmentsStatus> {
        self.status
    }

    pub(crate) fn merge_status(&mut self, status: BigSegmentsStatus) {
        self.status = Some(match self.status {
            Some(current) => current.merge(status),
            None => status,
        });
    }

    /// Returns the membership of `context_key`, querying the store only the first time the key
    /// is asked about during this evaluation.
    pub(crate) async fn membership(
        &mut self,
        store: &dyn Store,
        context_key: &str,
    ) -> Option<&BigSegmentMembership> {
        if !self.memberships.contains_key(context_key) {
            debug!("querying big segment membership for context key {}", context_key);
            let (membership, status) = match store.big_segment_membership(context_key).await {
                Some(result) => (result.membership, result.status),
                None => (None, BigSegmentsStatus::NotConfigured),
            };
            self.merge_status(status);
            self.memberships.insert(context_key.to_owned(), membership);
        }

        self.memberships.get(context_key).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;
    use tokio_test::block_on;

    use super::*;
    use crate::test_common::TestStore;

    #[test_case(BigSegmentsStatus::Healthy, BigSegmentsStatus::Stale, BigSegmentsStatus::Stale)]
    #[test_case(BigSegmentsStatus::Stale, BigSegmentsStatus::Healthy, BigSegmentsStatus::Stale)]
    #[test_case(BigSegmentsStatus::StoreError, BigSegmentsStatus::Stale, BigSegmentsStatus::StoreError)]
    #[test_case(BigSegmentsStatus::NotConfigured, BigSegmentsStatus::StoreError, BigSegmentsStatus::NotConfigured)]
    #[test_case(BigSegmentsStatus::Healthy, BigSegmentsStatus::Healthy, BigSegmentsStatus::Healthy)]
    fn statuses_merge_to_the_least_healthy(
        a: BigSegmentsStatus,
        b: BigSegmentsStatus,
        expected: BigSegmentsStatus,
    ) {
        assert_eq!(a.merge(b), expected);

        let mut state = BigSegmentsState::default();
        state.merge_status(a);
        state.merge_status(b);
        assert_that!(state.status()).contains_value(expected);
    }

    #[test]
    fn statuses_serialize_in_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(BigSegmentsStatus::StoreError).unwrap(),
            json!("STORE_ERROR")
        );
        assert_eq!(
            serde_json::to_value(BigSegmentsStatus::NotConfigured).unwrap(),
            json!("NOT_CONFIGURED")
        );
    }

    #[test]
    fn membership_reports_inclusion_and_exclusion() {
        let membership = BigSegmentMembership::new(hashmap! {
            "in.g1".to_string() => true,
            "out.g1".to_string() => false,
        });
        assert_that!(membership.check("in.g1")).contains_value(true);
        assert_that!(membership.check("out.g1")).contains_value(false);
        assert_that!(membership.check("in.g2")).is_none();
    }

    #[test]
    fn membership_is_queried_once_per_context_key() {
        let store = TestStore::new().with_big_segments(
            BigSegmentsStatus::Stale,
            hashmap! {"alice".to_string() => BigSegmentMembership::new(hashmap! {"s.g1".to_string() => true})},
        );
        let mut state = BigSegmentsState::default();

        block_on(async {
            assert_that!(state
                .membership(&store, "alice")
                .await
                .and_then(|m| m.check("s.g1")))
            .contains_value(true);
            assert!(state.membership(&store, "alice").await.is_some());
            assert!(state.membership(&store, "bob").await.is_none());
        });

        assert_eq!(store.big_segment_queries(), 2);
        assert_that!(state.status()).contains_value(BigSegmentsStatus::Stale);
    }

    #[test]
    fn unconfigured_store_reports_not_configured() {
        let store = TestStore::new();
        let mut state = BigSegmentsState::default();

        let membership = block_on(state.membership(&store, "alice")).cloned();
        assert_that!(membership).is_none();
        assert_that!(state.status()).contains_value(BigSegmentsStatus::NotConfigured);
    }
}
