//! Strata CLI - build, resolve and push deterministic container images.

pub mod commands;
