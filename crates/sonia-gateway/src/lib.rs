//! Sonia Gateway - Turn pipeline and session plane.
//!
//! Orchestrates one user turn end-to-end: admit (back-pressure and
//! idempotency), recall (hybrid memory search), model call, tool
//! routing through the policy engine and the confirmation plane,
//! persistence through the at-least-once outbox, and the streaming HTTP
//! surface. Sessions and confirmation tokens live in write-through
//! caches over the durable state store and survive restarts.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod confirmation;
pub mod http;
pub mod outbox;
pub mod pipeline;
pub mod router_client;
pub mod session;

pub use confirmation::ConfirmationManager;
pub use http::{router, AppState};
pub use outbox::OutboxWorker;
pub use pipeline::{TurnPipeline, TurnRequest, TurnResponse};
pub use router_client::{ChatMessage, ChatRequest, ChatResponse, HttpModelRouter, ModelRouter, ToolCallRequest};
pub use session::SessionManager;
