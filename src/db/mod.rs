//! Database module: SQL repositories over the relational layout.
//!
//! All queries map rows into the typed entities from `crate::model` right at
//! this boundary. External modules should import from `tg_relaybot::db`; the
//! repository API is re-exported here.

pub mod repo;

pub use repo::*;
