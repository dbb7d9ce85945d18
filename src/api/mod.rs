//! HTTP access to the remote API.

mod client;

pub use client::{ApiClient, Query};
