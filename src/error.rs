use thiserror::Error;

#[derive(Error, Debug)]
pub enum DpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Table backend error: {0}")]
    Table(String),

    #[error("IP set error: {0}")]
    IpSet(String),

    #[error("Route programming error: {0}")]
    Route(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Map layout error: {0}")]
    MapLayout(String),

    #[error("Conntrack error: {0}")]
    Conntrack(String),

    #[error("Program load error: {0}")]
    ProgramLoad(String),

    #[error("Program attach error: {0}")]
    ProgramAttach(String),

    #[error("Mark allocation error: {0}")]
    MarkAllocation(String),

    #[error("Endpoint mark space exhausted")]
    EndpointMarksExhausted,

    #[error("Lock timeout")]
    LockTimeout,

    #[error("Update rejected: {0}")]
    UpdateRejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DpError {
    /// Fatal errors require a process restart; everything else is
    /// retried by the driver on its retry tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DpError::ProgramLoad(_) | DpError::MarkAllocation(_) | DpError::Configuration(_)
        )
    }
}

impl Clone for DpError {
    fn clone(&self) -> Self {
        match self {
            DpError::Io(e) => DpError::Internal(e.to_string()),
            DpError::Netlink(s) => DpError::Netlink(s.clone()),
            DpError::Table(s) => DpError::Table(s.clone()),
            DpError::IpSet(s) => DpError::IpSet(s.clone()),
            DpError::Route(s) => DpError::Route(s.clone()),
            DpError::Render(s) => DpError::Render(s.clone()),
            DpError::MapLayout(s) => DpError::MapLayout(s.clone()),
            DpError::Conntrack(s) => DpError::Conntrack(s.clone()),
            DpError::ProgramLoad(s) => DpError::ProgramLoad(s.clone()),
            DpError::ProgramAttach(s) => DpError::ProgramAttach(s.clone()),
            DpError::MarkAllocation(s) => DpError::MarkAllocation(s.clone()),
            DpError::EndpointMarksExhausted => DpError::EndpointMarksExhausted,
            DpError::LockTimeout => DpError::LockTimeout,
            DpError::UpdateRejected(s) => DpError::UpdateRejected(s.clone()),
            DpError::NotFound(s) => DpError::NotFound(s.clone()),
            DpError::InvalidInput(s) => DpError::InvalidInput(s.clone()),
            DpError::Configuration(s) => DpError::Configuration(s.clone()),
            DpError::Serialization(s) => DpError::Serialization(s.clone()),
            DpError::Environment(s) => DpError::Environment(s.clone()),
            DpError::ChannelClosed(s) => DpError::ChannelClosed(s.clone()),
            DpError::Internal(s) => DpError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DpError>;

impl From<serde_json::Error> for DpError {
    fn from(e: serde_json::Error) -> Self {
        DpError::Serialization(e.to_string())
    }
}

impl From<rtnetlink::Error> for DpError {
    fn from(e: rtnetlink::Error) -> Self {
        DpError::Netlink(e.to_string())
    }
}
