//! Turnstile - Request Admission Control
//!
//! This crate implements fixed-window rate limiting for an HTTP service.
//! Each request is mapped to a partition key (by network address or by API
//! credential), counted in a shared counter store such as Redis, and either
//! passed on or rejected before it reaches its handler.

pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
