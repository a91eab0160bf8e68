//! Backend adapters
//!
//! - Console: JSON-lines event ingress from stdin
//! - OneBot: HTTP client for outbound API calls

pub mod console;
pub mod onebot;

pub use console::{ConsoleAdapter, ConsoleSummary};
pub use onebot::{HttpApiClient, HttpClientSettings};
