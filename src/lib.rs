//! Ozone auto-labeler.
//!
//! Watches a labeler's moderation queue for reports filed by trusted
//! moderators and applies the label commands written in their comments.
mod applier;
mod auth;
mod autoban;
mod chat;
mod command;
mod config;
pub mod error;
mod metrics;
mod models;
mod notify;
mod ozone;
mod poller;
mod retry;
mod serve;
mod storage;
mod target;
#[cfg(test)]
mod tests;

pub use serve::run;
