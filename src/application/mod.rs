pub mod command_handlers;
pub mod dependency_container;
pub mod lifecycle;

pub use command_handlers::*;
pub use dependency_container::*;
pub use lifecycle::shutdown_signal;
