//! Error types for cns-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server and the update pipeline.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis backend error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record store failure that did not come from a backend client.
    #[error("Record store error: {0}")]
    Store(String),

    /// Stored JSON could not be encoded or decoded.
    #[error("Corrupt stored data: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A resource record could not be decoded from its stored form.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A record id was not found under the given name.
    #[error("no record with id {id} under {name} in zone {zone}")]
    RecordNotFound {
        /// Zone that was searched.
        zone: String,
        /// Owner name (leaf) that was searched.
        name: String,
        /// Record id that was requested.
        id: String,
    },

    /// A peer did not answer a NOTIFY or probe usefully.
    #[error("peer {peer}: {reason}")]
    Peer {
        /// Peer address.
        peer: String,
        /// What went wrong.
        reason: String,
    },

    /// A serial operation was attempted with no serial open.
    #[error("no serial is open")]
    NoOpenSerial,

    /// The commit engine task has stopped.
    #[error("commit engine has shut down")]
    EngineClosed,
}

impl From<config::ConfigError> for DnsError {
    fn from(e: config::ConfigError) -> Self {
        DnsError::Config(e.to_string())
    }
}
