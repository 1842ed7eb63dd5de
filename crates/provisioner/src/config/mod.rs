mod cli;
mod controller;

pub use cli::Cli;
pub use cli::Commands;
pub use controller::BackendChoice;
pub use controller::ConfigError;
pub use controller::ControllerArgs;
pub use controller::Settings;
