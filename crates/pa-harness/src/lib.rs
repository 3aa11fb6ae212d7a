//! Harness: provider abstractions and reliability infrastructure for the
//! propai AI layer.
//!
//! This crate sits between the AI service wrapper and the concrete LLM
//! providers. It coordinates:
//! - Provider abstraction and the name → provider registry
//! - Per-key admission control (fixed window, sliding window, token bucket)
//! - Ordered provider fallback with per-attempt timeouts
//! - Shutdown coordination for background maintenance tasks

pub mod fallback;
pub mod provider;
pub mod rate_limiter;
pub mod shutdown;
