pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod jobs;
pub mod messages;
pub mod provider;
pub mod session;
pub mod stream;
pub mod todos;
pub mod tools;
