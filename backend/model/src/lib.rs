//! Database models for Kiln backend.
//!
//! ## Primary Key Uniqueness
//! All primary keys should be as unique as possible,
//! in order to avoid conflicts with all historical IDs.
//!
//! ## Status Columns
//! Both backends store lifecycle states in `status` (small integer) and
//! `status_msg` (nullable text). The `Sql*Status` enums are the only place
//! mapping between stored values and states.

pub mod branch;
pub mod db;
pub mod job;
pub mod package;
pub mod target;
