//! Shared state and messaging between the run controller and its observers
//!
//! The controller publishes a [`PresentationState`] snapshot through a watch
//! channel and a stream of [`RunEvent`]s for anything that wants a log of
//! what happened.

pub mod messages;
pub mod state;

pub use messages::{EventBus, RunEvent};
pub use state::{PresentationState, RunMetadata, RunPhase};
