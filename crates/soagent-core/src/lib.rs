pub mod events;
pub mod ids;
pub mod messages;
pub mod partial_json;
pub mod provider;
