//! Inference provider integration - OpenRouter API
//!
//! This module provides:
//! - The [`InferenceProvider`] trait the pipeline depends on
//! - An OpenRouter HTTP client implementing it
//! - Request/response types matching the OpenAI-compatible API

mod client;
mod provider;
mod types;

pub use client::{LlmClient, LlmClientBuilder};
pub use provider::InferenceProvider;
pub use types::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ExtractedEntity,
    ExtractedFact, ExtractedGraph, Message, MessageRole,
};
