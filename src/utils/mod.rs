//! Utility functions shared by the augmentation and training modules
pub mod io;
pub mod math;

// Re-export commonly used utilities
pub use io::*;
pub use math::*;
