//! NMS command contract: wire types and the HTTP client.

pub mod client;
pub mod types;

pub use client::{HttpNmsClient, NmsApi};
pub use types::{AckResult, AckStatus, BundleReport, Command, PollResponse};
