//! AI services for propai: concrete LLM adapters, credential lookup, cost
//! tracking, feature flags, A/B test assignment and the [`ai_service`]
//! wrapper that chains them into one request pipeline.

pub mod ab_testing;
pub mod ai_service;
pub mod cost_tracker;
pub mod credentials;
pub mod feature_flags;
pub mod llm;

pub use ai_service::{AiService, AiServiceBuilder, AiServiceError, AiServiceResponse, GenerateOptions};
