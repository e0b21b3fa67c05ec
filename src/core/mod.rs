//! Runtime components of the soak agent.

pub mod readiness;
pub mod soak;
