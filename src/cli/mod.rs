//! Command-line front end helpers.

pub mod output;
pub mod watch;

pub use output::StatusView;
pub use watch::WatchOptions;
