//! REST API client for the storefront backend.
//!
//! This module provides the `ApiClient` used as the snapshot source: it
//! fetches the list of active agencies and the product list of one agency.
//!
//! Requests carry the session's bearer token. Authentication itself (OTP
//! login) lives outside this crate; a 401 is reported as
//! `ApiError::Unauthorized` so the caller can tear the session down.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
