pub mod mem;
pub mod querier;
pub mod types;
