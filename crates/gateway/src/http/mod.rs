pub mod chat;
pub mod conversations;
pub mod health;
pub mod mcp;
pub mod models;
pub mod presets;
pub mod settings;
pub mod uploads;
