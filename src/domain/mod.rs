pub mod commands;
pub mod device;
pub mod location;
pub mod models;
pub mod reassembler;
pub mod settings;
