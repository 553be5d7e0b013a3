//! Detector plugins and their discovery.

pub mod builtin;
pub mod loader;
pub mod traits;

pub use builtin::BuiltinRegistry;
pub use loader::{DetectorHandle, DetectorLoader, LoaderError, PackageLoader};
pub use traits::{Detector, DetectorError, DetectorServices};
