#![deny(unsafe_code)]

/// Terminal front end: command parsing and the interactive loop.
pub mod app;
/// Chat domain types and the conversation session controller.
pub mod chat;
/// Preference persistence.
pub mod settings;
