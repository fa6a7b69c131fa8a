//! Protocol translation between the caller-facing wire formats and the
//! unified model.
//!
//! Each codec decodes requests, encodes one-shot responses and decodes them
//! back. The streaming encoders live in [`streaming`]. All translation
//! functions are pure (no I/O).

pub mod anthropic;
pub mod anthropic_types;
pub mod openai;
pub mod openai_types;
pub mod streaming;
