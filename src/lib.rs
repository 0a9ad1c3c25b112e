pub mod aggregation;
pub mod sqlite_pragma;
