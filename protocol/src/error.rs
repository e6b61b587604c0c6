//! Protocol error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(i32),
    
    #[error("Packet too small: expected at least {expected}, got {actual}")]
    PacketTooSmall { expected: usize, actual: usize },
    
    #[error("Packet too large: maximum {max}, got {actual}")]
    PacketTooLarge { max: usize, actual: usize },
    
    #[error("Invalid burst parameters: {0}")]
    InvalidBurst(String),
    
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}
