pub mod daemon;
pub mod hostfile;
pub mod leasefile;
pub mod manager;
pub mod reconciler;

pub use daemon::DnsmasqDaemon;
pub use manager::{DhcpManager, DhcpStats};
pub use reconciler::Reconciler;
