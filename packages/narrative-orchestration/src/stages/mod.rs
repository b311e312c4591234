// Built-in stage implementations
pub mod parsing;

// Re-exports
pub use parsing::{detect_chapters, fingerprint, PlainTextParser};
