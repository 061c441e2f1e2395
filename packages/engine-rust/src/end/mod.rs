//! The two ends of a link: each keeps a registry of its live operations and
//! routes incoming tickets to them.

mod back;
mod front;
mod registry;

pub use back::BackEnd;
pub use front::FrontEnd;
pub use registry::IdleAction;
