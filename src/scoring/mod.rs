pub mod fields;
pub mod splitting;
