//! Shared helpers: process bootstrap and retry schedules.

pub mod bootstrap;
pub mod retry;
