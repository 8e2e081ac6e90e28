pub mod events;
pub mod groups;
pub mod jobs;
pub mod maintenance;
pub mod workers;
