//! AWS integration through the `aws` command line client.

pub mod cli;
pub mod user_data;

pub use cli::{parse_instance_id, parse_instance_state, AwsCli};
pub use user_data::{render as render_user_data, UnitLocation};
