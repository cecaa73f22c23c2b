//! streamchat - streaming chat client and relay
//!
//! Conversations live in a local key-value store. Each user turn is sent to
//! a relay (or straight to the workflow backend) and the generated text is
//! written into the conversation as it streams in, until it finishes, fails
//! or the user stops it.

pub mod config;
pub mod kv;
pub mod relay;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod transcript;
pub mod upstream;
