//! Chat moderation and contact-circumvention detection.
//!
//! The [`engine::ModerationEngine`] runs each outbound message through the
//! content filter and the split-number detector, records violations in the
//! ledger and returns the user's current risk profile.

pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod filter;
pub mod history;
pub mod ledger;
pub mod lexicon;
pub mod metrics;
pub mod models;
pub mod similarity;
pub mod split;
