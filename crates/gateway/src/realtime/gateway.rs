//! Inbound frame dispatch
//!
//! Parses and validates a frame, then maps it to one engine call on behalf
//! of the connected party. Results reach the parties as session events
//! through the registry; only failures are answered directly.

use super::protocol::{ClientFrame, ServerFrame};
use parley_common::engine::SessionEngine;
use parley_common::errors::{AppError, Result};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct SessionGateway {
    engine: Arc<SessionEngine>,
}

impl SessionGateway {
    pub fn new(engine: Arc<SessionEngine>) -> Self {
        Self { engine }
    }

    /// Handle one text frame; returns an error frame for the sender, if any
    pub async fn handle_text(&self, party_id: &str, text: &str) -> Option<String> {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = AppError::Validation {
                    message: format!("malformed frame: {}", e),
                    field: None,
                };
                return Some(ServerFrame::from_error(&err, None).to_json());
            }
        };

        let event = frame.name();
        match self.dispatch(party_id, frame).await {
            Ok(()) => None,
            Err(err) => {
                debug!(party_id = %party_id, event, error = %err, "Frame refused");
                Some(ServerFrame::from_error(&err, Some(event)).to_json())
            }
        }
    }

    #[instrument(skip(self, frame), fields(event = frame.name()))]
    pub async fn dispatch(&self, party_id: &str, frame: ClientFrame) -> Result<()> {
        frame.validate().map_err(|e| AppError::Validation {
            message: e.to_string(),
            field: None,
        })?;

        match frame {
            ClientFrame::CreateRequest(request) => {
                self.engine
                    .create_session(party_id, &request.provider_id, request.kind)
                    .await?;
            }
            ClientFrame::Confirm(target) => {
                self.engine.confirm(&target.session_id, party_id).await?;
            }
            ClientFrame::Join(target) => {
                self.engine.join(&target.session_id, party_id).await?;
            }
            ClientFrame::End(target) => {
                self.engine.end(&target.session_id, party_id).await?;
            }
            ClientFrame::Reject(target) => {
                self.engine.reject(&target.session_id, party_id).await?;
            }
        }
        Ok(())
    }
}
