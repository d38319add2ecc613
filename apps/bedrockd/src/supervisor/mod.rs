mod protocol;
mod server;
mod state;

pub use protocol::Driver;
pub use server::{ResourceUsage, ServerEvent, ServerHandle};
