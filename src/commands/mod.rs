mod config_cmd;
mod models_cmd;

pub use config_cmd::handle_config;
pub use models_cmd::{run_models, run_test};
