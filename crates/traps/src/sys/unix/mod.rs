//! Implementation of fault handling for Unix-family platforms.

mod signals;

pub use signals::{install_handlers, restore_signal_mask};
