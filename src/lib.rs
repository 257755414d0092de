//! Upscale job pipeline
//!
//! This library provides the core of the upscale-pipeline system: a
//! priority job queue, a bounded worker pool that calls an external image
//! inference provider with retries, signed webhook callbacks, and
//! fixed-window admission control for the HTTP API.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
