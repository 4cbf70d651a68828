//! Gate consulted before a peer is upgraded and handed to the hub.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    connection::ConnectionId,
    rooms::{RoomError, RoomRepository},
};

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub connection_id: ConnectionId,
    /// Room named by the peer in its upgrade request, if any.
    pub room_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("a room id is required")]
    MissingRoom,
    #[error(transparent)]
    Room(#[from] RoomError),
}

#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    async fn admit(&self, request: &AdmissionRequest) -> Result<(), AdmissionError>;
}

/// Used when no room gate is wired in.
pub struct AlwaysAdmit;

#[async_trait]
impl AdmissionPolicy for AlwaysAdmit {
    async fn admit(&self, _request: &AdmissionRequest) -> Result<(), AdmissionError> {
        Ok(())
    }
}

/// Admits peers only into rooms that currently exist.
pub struct RoomAdmission {
    rooms: Arc<dyn RoomRepository>,
}

impl RoomAdmission {
    pub fn new(rooms: Arc<dyn RoomRepository>) -> Self {
        Self { rooms }
    }
}

#[async_trait]
impl AdmissionPolicy for RoomAdmission {
    async fn admit(&self, request: &AdmissionRequest) -> Result<(), AdmissionError> {
        let room_id = request
            .room_id
            .as_deref()
            .filter(|room| !room.is_empty())
            .ok_or(AdmissionError::MissingRoom)?;
        self.rooms
            .add_peer_to_room(room_id, &request.connection_id.to_string())
            .await?;
        Ok(())
    }
}
