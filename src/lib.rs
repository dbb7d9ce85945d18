//! Transparent caching for remote API clients, time-based freshness
//! predicates, and a resumable label-correction sync built on both.

pub mod api;
pub mod cache;
pub mod config;
pub mod freshness;
pub mod logging;
pub mod sync;
