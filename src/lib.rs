pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod lease;
pub mod netns;
pub mod options;
pub mod orchestrator;
pub mod packet;
pub mod persist;

pub use config::{CmdArgs, DaemonConfig, NetConf};
pub use daemon::{Daemon, IpamResult};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseState};
pub use options::MessageType;
pub use packet::DhcpPacket;
