pub mod errors;
pub mod events;
pub mod health;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;
pub mod tools;
