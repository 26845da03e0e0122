//! HTTP shell: a thin adapter between axum and the gateway pipeline.
//!
//! Nothing in this module makes routing, budget, or cache decisions — it
//! only translates HTTP concerns (status codes, JSON bodies, bearer tokens)
//! into a [`crate::models::Request`] and back.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod client_auth;
pub mod health;
pub mod request_id;
