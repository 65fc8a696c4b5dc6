pub mod range;
pub mod reduce;

pub use range::{KeyBound, KeyRange, Order, RangePage, RangeQuery, RangeRow, execute_range};
pub use reduce::{Grouping, ReduceQuery, ReduceRow, count_distinct_groups, execute_reduce};
