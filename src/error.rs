#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Network namespace unavailable: {0}")]
    NamespaceUnavailable(String),

    #[error("Link {0} not found")]
    LinkNotFound(String),

    #[error("No DHCP offer received")]
    NoOffer,

    #[error("No DHCP acknowledgement: {0}")]
    NoAck(String),

    #[error("Offered address failed the address check and was declined")]
    Declined,

    #[error("DHCP acquisition timed out")]
    Timeout,

    #[error("lease was stopped during acquisition")]
    Canceled,

    #[error("Lease for {0} was lost")]
    LeaseLost(String),

    #[error("Failed to persist leases: {0}")]
    PersistenceFailed(String),

    #[error("Orchestrator API error: {0}")]
    OrchestratorUnreachable(String),

    #[error("Socket error: {0}")]
    Socket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
