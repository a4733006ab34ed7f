//! Slomo - Sliding-Window Request Admission Gate
//!
//! This crate places an admission gate in front of an HTTP application. Every
//! request is checked against a shared log of recently admitted requests held
//! in a key-value store; once the trailing window holds `capacity` entries,
//! further requests are refused with a 429 until the oldest entry ages out.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
