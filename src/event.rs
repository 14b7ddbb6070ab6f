use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected {
        client_id: Uuid,
        remote: SocketAddr,
    },

    Disconnected {
        client_id: Uuid,
        remote: SocketAddr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected {
        client_id: Uuid,
        remote: SocketAddr,
    },

    Disconnected {
        client_id: Uuid,
        remote: SocketAddr,
    },

    Error {
        remote: SocketAddr,
        error: String,
    },
}
