use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::command::{CommandSet, DimseMessage};
use crate::provider::{RetrieveSink, RetrievedDataset};
use crate::registry::{ServiceContext, ServiceHandler};
use crate::status::{self, IDENTIFIER_DOES_NOT_MATCH, UNABLE_TO_PROCESS};
use crate::transport::DimseChannel;
use crate::types::{CommandField, DimseStatus};
use crate::Result;

/// Storage service (C-STORE): hands each received dataset to a [`RetrieveSink`].
///
/// This is the receiving end of C-MOVE sub-operations.
pub struct StoreHandler {
    sink: Arc<dyn RetrieveSink>,
}

impl StoreHandler {
    pub fn new(sink: Arc<dyn RetrieveSink>) -> Self {
        Self { sink }
    }

    async fn store(&self, ctx: &ServiceContext, request: &DimseMessage) -> (DimseStatus, Option<String>) {
        let transfer_syntax = match ctx.transfer_syntax(request.presentation_context_id) {
            Ok(ts) => ts.to_string(),
            Err(e) => return (DimseStatus::Failure(UNABLE_TO_PROCESS), Some(e.to_string())),
        };

        let dataset = match request.dataset(&transfer_syntax) {
            Ok(Some(dataset)) => dataset,
            Ok(None) => {
                return (
                    DimseStatus::Failure(IDENTIFIER_DOES_NOT_MATCH),
                    Some("C-STORE request without data set".to_string()),
                )
            }
            Err(e) => return (DimseStatus::Failure(UNABLE_TO_PROCESS), Some(e.to_string())),
        };

        let retrieved = RetrievedDataset {
            sop_class_uid: request.command.affected_sop_class_uid.clone().unwrap_or_default(),
            sop_instance_uid: request
                .command
                .affected_sop_instance_uid
                .clone()
                .unwrap_or_default(),
            transfer_syntax,
            dataset,
        };

        match self.sink.store(retrieved).await {
            Ok(()) => (DimseStatus::Success, None),
            Err(e) => {
                warn!("Failed to store received dataset: {}", e);
                (status::sink_error_to_dimse(&e), Some(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl ServiceHandler for StoreHandler {
    fn command(&self) -> CommandField {
        CommandField::CStoreRq
    }

    async fn handle(
        &self,
        ctx: &ServiceContext,
        request: DimseMessage,
        channel: &mut dyn DimseChannel,
    ) -> Result<()> {
        debug!(
            "Processing C-STORE of {:?}",
            request.command.affected_sop_instance_uid
        );
        let (status, comment) = self.store(ctx, &request).await;

        let mut response = CommandSet::response_to(&request.command, status)?;
        if let Some(comment) = comment {
            response = response.with_error_comment(comment);
        }
        channel
            .send(DimseMessage::new(request.presentation_context_id, response))
            .await
    }
}
