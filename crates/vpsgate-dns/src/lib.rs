pub mod delegation;
pub mod directory;
pub mod resolve;
pub mod server;

pub use directory::{GameServerInfo, ResourceDirectory};
pub use resolve::Resolver;
pub use server::DnsServer;
