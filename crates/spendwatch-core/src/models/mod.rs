//! Data models for Spendwatch

mod alert;
mod event;
mod summary;
mod window;

pub use alert::*;
pub use event::*;
pub use summary::*;
pub use window::*;
