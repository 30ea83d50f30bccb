pub mod bucket;
pub mod plan;
pub mod query;

pub use bucket::*;
pub use plan::*;
pub use query::*;
