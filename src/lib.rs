//! Provider-neutral mail core: Gmail and IMAP adapters behind one driver,
//! a thread cache kept fresh by sync, and optimistic mutations that settle
//! in the background.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod parse;
pub mod provider;
pub mod queue;
pub mod sync;
pub mod threading;

#[cfg(test)]
mod testing;

pub use client::MailClient;
pub use error::{MailError, MailResult};
pub use ledger::Mutation;
