pub mod jobs;
pub mod sched;
pub mod server;
pub mod wire;
pub mod workers;
