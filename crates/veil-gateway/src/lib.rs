pub mod connection;
pub mod directory;
pub mod registry;
pub mod relay;
pub mod rooms;
