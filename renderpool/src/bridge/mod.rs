//! Wire contract between the pool and a worker process.
//!
//! - **protocol**: readiness line parsing and render request construction
//! - **driver**: the bootstrap appended to the rendering code before launch

pub mod driver;
pub mod protocol;
