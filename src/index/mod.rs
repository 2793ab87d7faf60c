pub mod filters;
pub mod tag_index;

pub use filters::{parse_tag_filter, TagFilter, TagPredicate};
pub use tag_index::TagIndex;
