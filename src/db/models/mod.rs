#![allow(unused_imports)]

//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` keep working.

pub mod batch_job;
pub mod email;
pub mod idempotency;
pub mod job_log;

pub use self::batch_job::*;
pub use self::email::*;
pub use self::idempotency::*;
pub use self::job_log::*;
