//! Captured traffic: entries, the bounded store, filters, and the TUI view boundary.

pub mod entry;
pub mod filter;
pub mod store;
pub mod view;

pub use entry::{CaptureEntry, Headers, Scheme};
pub use filter::{FilterState, HostFilter, HostPatterns, MethodFilter, StatusFilter};
pub use store::CaptureStore;
pub use view::{CaptureCommand, CaptureView};
