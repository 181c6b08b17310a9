//! Utility modules for stepstream

pub mod cancel;

pub use cancel::CancelHandle;
