pub mod actions;
pub mod active;
pub mod contract;
pub mod events;
pub mod loops;
pub mod memory;
pub mod preflight;
pub mod research;
pub mod stage_result;
