//! Docker Registry HTTP API v2 client.
//!
//! Covers the subset strata needs: blob and manifest existence checks,
//! monolithic and chunked blob upload, cross-repository mount, manifest
//! put, and manifest/blob get for remote resolution.

mod auth;
mod client;

pub use auth::RegistryAuth;
pub use client::RegistryClient;
