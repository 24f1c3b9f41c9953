//! HTTP ingress for the orchestrator.
//!
//! A messaging gateway posts inbound fragments here as webhooks; replies
//! and follow-ups go back out through the configured transport.
//!
//! # Endpoints
//!
//! - `GET  /health`                      — Liveness probe
//! - `POST /conversations/:id/messages`  — Inbound fragment
//! - `GET  /conversations/:id`           — Conversation status
//! - `POST | DELETE /conversations/:id/follow-ups` — Arm or cancel follow-ups

pub mod routes;

pub use routes::{app_router, AppState};
