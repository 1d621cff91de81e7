mod attribute_value;
mod big_segments;
mod bucket;
mod contexts;
mod error;
mod eval;
mod flag;
mod flag_value;
mod rule;
mod segment;
mod store;
mod test_common;
mod util;
mod variation;

pub use attribute_value::*;
pub use big_segments::{
    BigSegmentMembership, BigSegmentMembershipResult, BigSegmentsStatus,
};
pub use contexts::*;
pub use error::*;
pub use eval::*;
pub use flag::*;
pub use flag_value::*;
pub use rule::*;
pub use segment::*;
pub use store::*;
pub use variation::*;
