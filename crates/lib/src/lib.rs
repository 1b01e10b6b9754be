//! Willow core library: session lifecycle and state synchronization for the chat client.
//!
//! The [`engine::ConversationEngine`] owns the session and drives the store, the backend
//! client, the typing reveal, the idle reset and lead capture.

pub mod backend;
pub mod clock;
pub mod closing;
pub mod config;
pub mod device;
pub mod engine;
pub mod inactivity;
pub mod leads;
pub mod reveal;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;
