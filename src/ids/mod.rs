//! Identifier types for the control plane core (C1).
//!
//! - [`short_id`] — Stripe-style prefixed short IDs for agents, rules, and
//!   other entities.
//! - [`token`] — HMAC-based agent bearer tokens minted and verified by this
//!   crate.

pub mod short_id;
pub mod token;
