pub mod backup;
pub mod config;
pub mod host;
pub mod instance;
pub mod ipc;
pub mod patcher;
pub mod plugin;
pub mod process_monitor;
pub mod protocol;
pub mod resource;
pub mod supervisor;
pub mod utils;
