pub mod forecast;
pub mod scheduler;
pub mod series;

// Re-export command functions for convenience
pub use forecast::forecast;
pub use scheduler::{metrics, notify, run, tick};
pub use series::{
    cancel, create, document, list, pause, resume, show, update, upcoming, CreateArgs, UpdateArgs,
};
