// SPDX-License-Identifier: MIT
//! Ordering primitives shared by the hub: the per-task action log and the
//! backoff schedule used when durable writes fail.

pub mod backoff;
pub mod log;

pub use backoff::Backoff;
pub use log::ActionLog;
