//! Query service (C-FIND)
//!
//! One request produces a pending response per candidate and a final response
//! without a data set. A C-CANCEL-RQ for the request is checked before every
//! candidate is pulled from the provider; once seen, the provider is cancelled
//! and asked for nothing more.

use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::{debug, info, warn};

use crate::command::{CommandSet, DimseMessage};
use crate::provider::MatchProvider;
use crate::registry::{ServiceContext, ServiceHandler};
use crate::status::{self, IDENTIFIER_DOES_NOT_MATCH};
use crate::transport::DimseChannel;
use crate::types::{CommandField, DimseStatus};
use crate::Result;

pub struct FindHandler {
    provider: Arc<dyn MatchProvider>,
}

impl FindHandler {
    pub fn new(provider: Arc<dyn MatchProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ServiceHandler for FindHandler {
    fn command(&self) -> CommandField {
        CommandField::CFindRq
    }

    async fn handle(
        &self,
        ctx: &ServiceContext,
        request: DimseMessage,
        channel: &mut dyn DimseChannel,
    ) -> Result<()> {
        let pcid = request.presentation_context_id;
        let transfer_syntax = ctx.transfer_syntax(pcid)?.to_string();
        let abstract_syntax = ctx.abstract_syntax(pcid)?.to_string();
        let message_id = request.command.message_id.unwrap_or_default();

        let identifier = match request.dataset(&transfer_syntax) {
            Ok(Some(identifier)) => identifier,
            Ok(None) => {
                return send_final(
                    channel,
                    pcid,
                    &request.command,
                    DimseStatus::Failure(IDENTIFIER_DOES_NOT_MATCH),
                    Some("C-FIND request without identifier"),
                )
                .await;
            }
            Err(e) => {
                warn!("Unreadable C-FIND identifier: {}", e);
                return send_final(
                    channel,
                    pcid,
                    &request.command,
                    DimseStatus::Failure(IDENTIFIER_DOES_NOT_MATCH),
                    Some("Identifier could not be decoded"),
                )
                .await;
            }
        };

        debug!(message_id, model = %abstract_syntax, "Starting C-FIND");
        let mut query = match self.provider.start_query(&abstract_syntax, &identifier).await {
            Ok(query) => query,
            Err(e) => {
                warn!("Query could not be started: {}", e);
                let status = status::provider_error_to_dimse(&e);
                return send_final(channel, pcid, &request.command, status, Some(&e.to_string())).await;
            }
        };

        let mut matches = 0usize;
        let (final_status, comment) = loop {
            if channel.cancel_requested(message_id) {
                info!("C-FIND {} cancelled after {} matches", message_id, matches);
                query.cancel().await;
                break (DimseStatus::Cancel, None);
            }

            match query.next().await {
                Ok(Some(candidate)) => {
                    let candidate = stamp_retrieve_ae_title(candidate, &ctx.ae_title);
                    let response = CommandSet::response_to(&request.command, DimseStatus::Pending)?;
                    match DimseMessage::new(pcid, response).with_dataset(&candidate, &transfer_syntax) {
                        Ok(message) => {
                            channel.send(message).await?;
                            matches += 1;
                        }
                        Err(e) => warn!("Skipping candidate that could not be encoded: {}", e),
                    }
                }
                Ok(None) => break (DimseStatus::Success, None),
                Err(e) => {
                    warn!("Query failed after {} matches: {}", matches, e);
                    break (status::provider_error_to_dimse(&e), Some(e.to_string()));
                }
            }
        };

        debug!(message_id, matches, status = %final_status, "C-FIND finished");
        send_final(channel, pcid, &request.command, final_status, comment.as_deref()).await
    }
}

fn stamp_retrieve_ae_title(mut candidate: InMemDicomObject, ae_title: &str) -> InMemDicomObject {
    candidate.put(DataElement::new(
        tags::RETRIEVE_AE_TITLE,
        VR::AE,
        PrimitiveValue::from(ae_title),
    ));
    candidate
}

async fn send_final(
    channel: &mut dyn DimseChannel,
    presentation_context_id: u8,
    request: &CommandSet,
    status: DimseStatus,
    comment: Option<&str>,
) -> Result<()> {
    let mut response = CommandSet::response_to(request, status)?;
    if let Some(comment) = comment {
        response = response.with_error_comment(comment);
    }
    channel
        .send(DimseMessage::new(presentation_context_id, response))
        .await
}
