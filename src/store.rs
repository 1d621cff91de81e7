use async_trait::async_trait;

use crate::big_segments::BigSegmentMembershipResult;
use crate::flag::Flag;
use crate::segment::Segment;

/// Store is the source of the flag and segment data an evaluation reads.
///
/// Flags and segments are looked up synchronously, since they are expected to live in memory.
/// Big segment membership usually lives in a remote store, so that lookup is asynchronous; an
/// implementation is responsible for its own timeouts and should answer with a
/// [crate::BigSegmentsStatus::StoreError] status rather than hang.
#[async_trait]
pub trait Store: Send + Sync {
    /// Retrieve the flag with key `flag_key`.
    fn flag(&self, flag_key: &str) -> Option<&Flag>;

    /// Retrieve the segment with key `segment_key`.
    fn segment(&self, segment_key: &str) -> Option<&Segment>;

    /// Query which big segments the context with key `context_key` belongs to.
    ///
    /// Returning None means big segments are not configured for this store.
    async fn big_segment_membership(&self, _context_key: &str) -> Option<BigSegmentMembershipResult> {
        None
    }
}
