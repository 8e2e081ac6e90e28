//! Row models, DTOs, and the closed status enums.

pub mod frame;
pub mod job;
pub mod status;
pub mod worker;
