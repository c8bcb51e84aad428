pub mod metric;
pub mod scope;
