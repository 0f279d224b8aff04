use async_trait::async_trait;
use tracing::debug;

use crate::command::{CommandSet, DimseMessage};
use crate::registry::{ServiceContext, ServiceHandler};
use crate::transport::DimseChannel;
use crate::types::{CommandField, DimseStatus};
use crate::Result;

/// Verification service: every C-ECHO-RQ is answered with Success
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ServiceHandler for EchoHandler {
    fn command(&self) -> CommandField {
        CommandField::CEchoRq
    }

    async fn handle(
        &self,
        _ctx: &ServiceContext,
        request: DimseMessage,
        channel: &mut dyn DimseChannel,
    ) -> Result<()> {
        debug!("Processing C-ECHO request {:?}", request.command.message_id);
        let response = CommandSet::response_to(&request.command, DimseStatus::Success)?;
        channel
            .send(DimseMessage::new(request.presentation_context_id, response))
            .await
    }
}
