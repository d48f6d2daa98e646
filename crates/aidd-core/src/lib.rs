pub mod actions;
pub mod active;
pub mod ast_index;
pub mod contract;
pub mod context_quality;
pub mod docops;
pub mod error;
pub mod events;
pub mod gates;
pub mod io;
pub mod lock;
pub mod loop_pack;
pub mod memory;
pub mod output_contract;
pub mod paths;
pub mod policy;
pub mod preflight;
pub mod research;
pub mod schema;
pub mod scope;
pub mod stage;
pub mod stage_result;

pub use error::{AiddError, Result};
