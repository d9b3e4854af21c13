pub mod events;
pub mod git;
pub mod image;
pub mod manifest;
pub mod platform;
pub mod registry;
pub mod release;
pub mod settings;
