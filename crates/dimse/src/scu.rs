//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::time::Duration;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_ul::association::ClientAssociationOptions;
use futures::stream::BoxStream;
use tracing::{debug, error, info, warn};

use crate::association::{Association, LocalRole, NegotiatedContext};
use crate::command::{self, CommandSet, DimseMessage, SubOperations};
use crate::config::{DimseConfig, RemoteNode};
use crate::provider::{RetrieveSink, RetrievedDataset};
use crate::transport::{ClientChannel, DimseChannel, Incoming};
use crate::types::{CommandField, DimseStatus, QueryLevel};
use crate::uids;
use crate::{DimseError, Result};

/// Identifier of a C-MOVE: a whole study or one series of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveIdentifier {
    level: QueryLevel,
    study_instance_uid: String,
    series_instance_uid: Option<String>,
}

impl MoveIdentifier {
    /// Retrieve a whole study
    pub fn study(study_instance_uid: impl Into<String>) -> Self {
        Self {
            level: QueryLevel::Study,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: None,
        }
    }

    /// Retrieve one series of a study
    pub fn series(study_instance_uid: impl Into<String>, series_instance_uid: impl Into<String>) -> Self {
        Self {
            level: QueryLevel::Series,
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: Some(series_instance_uid.into()),
        }
    }

    /// Switch to study level, dropping any series key
    pub fn whole_study(mut self) -> Self {
        self.level = QueryLevel::Study;
        self.series_instance_uid = None;
        self
    }

    pub fn level(&self) -> QueryLevel {
        self.level
    }

    pub fn to_dataset(&self) -> InMemDicomObject {
        let mut identifier = InMemDicomObject::new_empty();
        identifier.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.level.to_string()),
        ));
        identifier.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(self.study_instance_uid.as_str()),
        ));
        if let Some(series) = &self.series_instance_uid {
            identifier.put(DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(series.as_str()),
            ));
        }
        identifier
    }
}

/// What a C-MOVE produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrieveSummary {
    /// C-MOVE-RSP messages received
    pub responses: usize,
    pub datasets_stored: usize,
    pub datasets_failed: usize,
    /// Last sub-operation counters reported by the peer
    pub sub_operations: SubOperations,
    /// Terminal status, if one arrived
    pub status: Option<DimseStatus>,
}

impl RetrieveSummary {
    pub fn is_success(&self) -> bool {
        self.status.map(|s| s.is_success()).unwrap_or(false)
    }
}

/// An open outbound association.
///
/// Dropped without [`release`](ScuAssociation::release), it is aborted.
pub struct ScuAssociation {
    association: Association,
    channel: ClientChannel,
}

impl ScuAssociation {
    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Raw channel, for exchanges the typed operations do not cover
    pub fn channel(&mut self) -> &mut ClientChannel {
        &mut self.channel
    }

    /// Release the association; failures are logged, never returned
    pub async fn release(mut self) {
        if let Err(e) = self.channel.request_release().await {
            warn!("Association release with '{}' failed: {}", self.association.called_ae_title(), e);
        }
        self.channel.close().await;
    }

    fn context_for(&self, abstract_syntax: &str) -> Result<(u8, String)> {
        self.association
            .context_for(abstract_syntax)
            .map(|pc| (pc.id, pc.transfer_syntax.clone()))
            .ok_or_else(|| {
                DimseError::operation_failed(format!(
                    "Peer did not accept abstract syntax {}",
                    abstract_syntax
                ))
            })
    }

    /// Next response to `message_id`, skipping anything else
    async fn next_response(&mut self, message_id: u16) -> Result<DimseMessage> {
        loop {
            match self.channel.receive().await? {
                Incoming::Message(message)
                    if message.command.command_field.is_response()
                        && message.command.message_id_being_responded_to == Some(message_id) =>
                {
                    return Ok(message)
                }
                Incoming::Message(message) => {
                    warn!("Ignoring unexpected {}", message.command_field());
                }
                Incoming::ReleaseRequested => {
                    if let Err(e) = self.channel.acknowledge_release().await {
                        debug!("Could not acknowledge release: {}", e);
                    }
                    return Err(DimseError::protocol("Peer released the association mid-operation"));
                }
                Incoming::ReleaseReplied => {
                    return Err(DimseError::protocol("Unsolicited A-RELEASE-RP"));
                }
                Incoming::Aborted => return Err(DimseError::Aborted),
            }
        }
    }
}

/// DIMSE Service Class User.
///
/// Message ids come from an internal counter, so one value serves one caller at a time.
pub struct DimseScu {
    config: DimseConfig,
    next_message_id: u16,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self {
            config,
            next_message_id: 1,
        }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Open an association proposing `abstract_syntaxes`, each with the uncompressed transfer syntaxes
    pub async fn open(&self, node: &RemoteNode, abstract_syntaxes: &[&str]) -> Result<ScuAssociation> {
        node.validate()?;
        let max_pdu = node.max_pdu_or(&self.config);
        let connect_timeout = node.connect_timeout_or(&self.config);
        let acse_timeout = self.config.acse_timeout();

        let options = abstract_syntaxes.iter().fold(
            ClientAssociationOptions::new()
                .calling_ae_title(self.config.ae_title.clone())
                .called_ae_title(node.ae_title.clone())
                .max_pdu_length(max_pdu)
                .connection_timeout(connect_timeout),
            |options, abstract_syntax| {
                options.with_presentation_context(
                    abstract_syntax.to_string(),
                    uids::UNCOMPRESSED_TRANSFER_SYNTAXES
                        .iter()
                        .map(|ts| ts.to_string())
                        .collect(),
                )
            },
        );

        let mut client = tokio::time::timeout(
            connect_timeout + acse_timeout,
            options.establish_async(node.address()),
        )
        .await
        .map_err(|_| {
            DimseError::Timeout(format!("establishing association with {}", node.address()))
        })??;

        let peer_addr = client.inner_stream().peer_addr()?;
        client.inner_stream().set_nodelay(true)?;
        let contexts = client
            .presentation_contexts()
            .iter()
            .map(|pc| {
                NegotiatedContext::accepted(
                    pc.id,
                    uids::trim_uid(&pc.abstract_syntax),
                    uids::trim_uid(&pc.transfer_syntax),
                    LocalRole::Scu,
                )
            })
            .collect();
        let association = Association::new(
            peer_addr,
            self.config.ae_title.clone(),
            node.ae_title.clone(),
            contexts,
            max_pdu,
            client.acceptor_max_pdu_length(),
            acse_timeout,
        );

        debug!(
            "Association {} established with {}@{}",
            association.id(),
            node.ae_title,
            node.address()
        );
        Ok(ScuAssociation {
            association,
            channel: ClientChannel::new(client, acse_timeout),
        })
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&mut self, node: &RemoteNode) -> Result<DimseStatus> {
        info!("Sending C-ECHO to {}@{}:{}", node.ae_title, node.host, node.port);

        let mut assoc = self.open(node, &[uids::VERIFICATION]).await?;
        let message_id = self.message_id();
        let result = Self::echo_on(&mut assoc, message_id).await;
        assoc.release().await;

        match &result {
            Ok(status) => info!("C-ECHO completed: {}", status),
            Err(e) => error!("C-ECHO failed: {}", e),
        }
        result
    }

    async fn echo_on(assoc: &mut ScuAssociation, message_id: u16) -> Result<DimseStatus> {
        let (pcid, _) = assoc.context_for(uids::VERIFICATION)?;
        let request = CommandSet::request(CommandField::CEchoRq, message_id, uids::VERIFICATION);
        assoc.channel.send(DimseMessage::new(pcid, request)).await?;
        let response = assoc.next_response(message_id).await?;
        response
            .command
            .dimse_status()
            .ok_or_else(|| DimseError::protocol("C-ECHO-RSP without status"))
    }

    /// Send a C-FIND request to a remote node.
    ///
    /// The returned stream yields every matching identifier; the association is
    /// released once the final response arrives. Dropping the stream earlier
    /// aborts it.
    pub async fn find(
        &mut self,
        node: &RemoteNode,
        information_model: &str,
        identifier: &InMemDicomObject,
    ) -> Result<BoxStream<'static, Result<InMemDicomObject>>> {
        info!(
            "Sending C-FIND to {}@{}:{} (model: {})",
            node.ae_title, node.host, node.port, information_model
        );

        let mut assoc = self.open(node, &[information_model]).await?;
        let message_id = self.message_id();
        let (pcid, transfer_syntax) = match assoc.context_for(information_model) {
            Ok(pc) => pc,
            Err(e) => {
                assoc.release().await;
                return Err(e);
            }
        };

        let request = DimseMessage::new(
            pcid,
            CommandSet::request(CommandField::CFindRq, message_id, information_model),
        )
        .with_dataset(identifier, &transfer_syntax);
        let sent = match request {
            Ok(request) => assoc.channel.send(request).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            assoc.release().await;
            return Err(e);
        }

        let stream = async_stream::stream! {
            let mut assoc = assoc;
            let mut matches = 0usize;
            loop {
                let response = match assoc.next_response(message_id).await {
                    Ok(response) => response,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                let status = response.command.dimse_status().unwrap_or(DimseStatus::Failure(0));
                if status.is_pending() {
                    match response.dataset(&transfer_syntax) {
                        Ok(Some(identifier)) => {
                            matches += 1;
                            yield Ok(identifier);
                        }
                        Ok(None) => debug!("Pending C-FIND-RSP without identifier"),
                        Err(e) => warn!("Undecodable C-FIND match: {}", e),
                    }
                    continue;
                }
                if !status.is_success() && status != DimseStatus::Cancel {
                    yield Err(DimseError::operation_failed(format!(
                        "C-FIND ended with {}{}",
                        status,
                        response
                            .command
                            .error_comment
                            .map(|c| format!(": {}", c))
                            .unwrap_or_default()
                    )));
                }
                debug!("C-FIND finished with {} matches ({})", matches, status);
                break;
            }
            assoc.release().await;
        };
        Ok(Box::pin(stream))
    }

    /// Send a C-MOVE request and hand every dataset carried by the responses to `sink`.
    ///
    /// Datasets moved over the peer's separate storage association arrive at
    /// the destination's Store handler, not here.
    pub async fn retrieve(
        &mut self,
        node: &RemoteNode,
        destination_ae_title: &str,
        identifier: &MoveIdentifier,
        sink: &dyn RetrieveSink,
    ) -> Result<RetrieveSummary> {
        info!(
            "Sending C-MOVE to {}@{}:{} (level: {}, dest: {})",
            node.ae_title, node.host, node.port, identifier.level(), destination_ae_title
        );

        let mut assoc = self
            .open(node, &[uids::STUDY_ROOT_FIND, uids::STUDY_ROOT_MOVE])
            .await?;
        let message_id = self.message_id();
        let result =
            Self::retrieve_on(&mut assoc, message_id, destination_ae_title, identifier, sink).await;
        assoc.release().await;

        if let Ok(summary) = &result {
            let moved = u32::from(summary.sub_operations.completed) + u32::from(summary.sub_operations.warning);
            if moved == 0 && summary.datasets_stored == 0 {
                info!("C-MOVE matched no data");
            } else {
                info!(
                    "C-MOVE finished: {} stored, {} failed, sub-operations {:?}",
                    summary.datasets_stored, summary.datasets_failed, summary.sub_operations
                );
            }
        }
        result
    }

    async fn retrieve_on(
        assoc: &mut ScuAssociation,
        message_id: u16,
        destination_ae_title: &str,
        identifier: &MoveIdentifier,
        sink: &dyn RetrieveSink,
    ) -> Result<RetrieveSummary> {
        let (pcid, transfer_syntax) = assoc.context_for(uids::STUDY_ROOT_MOVE)?;
        let mut request = CommandSet::request(CommandField::CMoveRq, message_id, uids::STUDY_ROOT_MOVE);
        request.move_destination = Some(destination_ae_title.to_string());
        let message = DimseMessage::new(pcid, request).with_dataset(&identifier.to_dataset(), &transfer_syntax)?;
        assoc.channel.send(message).await?;

        let mut summary = RetrieveSummary::default();
        loop {
            let response = assoc.next_response(message_id).await?;
            summary.responses += 1;
            if let Some(ops) = response.command.sub_operations {
                summary.sub_operations = ops;
            }

            if response.data.is_some() {
                Self::save_dataset(&response, &transfer_syntax, sink, &mut summary).await;
            }

            let status = response.command.dimse_status().unwrap_or(DimseStatus::Failure(0));
            if status.is_final() {
                summary.status = Some(status);
                break;
            }
        }
        Ok(summary)
    }

    async fn save_dataset(
        response: &DimseMessage,
        transfer_syntax: &str,
        sink: &dyn RetrieveSink,
        summary: &mut RetrieveSummary,
    ) {
        let dataset = match response.dataset(transfer_syntax) {
            Ok(Some(dataset)) => dataset,
            Ok(None) => return,
            Err(e) => {
                warn!("Undecodable dataset in C-MOVE-RSP: {}", e);
                summary.datasets_failed += 1;
                return;
            }
        };

        let target_syntax = if command::can_write(transfer_syntax) {
            transfer_syntax.to_string()
        } else {
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string()
        };
        let read_uid = |tag| {
            dataset
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| uids::trim_uid(&s).to_string())
                .unwrap_or_default()
        };
        let sop_class_uid = read_uid(tags::SOP_CLASS_UID);
        let sop_instance_uid = read_uid(tags::SOP_INSTANCE_UID);
        let retrieved = RetrievedDataset {
            sop_class_uid,
            sop_instance_uid: sop_instance_uid.clone(),
            transfer_syntax: target_syntax,
            dataset,
        };

        match sink.store(retrieved).await {
            Ok(()) => summary.datasets_stored += 1,
            Err(e) => {
                warn!("Failed to save retrieved dataset {}: {}", sop_instance_uid, e);
                summary.datasets_failed += 1;
            }
        }
    }

    /// Echo a remote node, retrying recoverable failures with exponential backoff
    pub async fn verify_with_retries(&mut self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        while retries <= max_retries {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries.min(5))).await;
            }

            match self.echo(node).await {
                Ok(status) => {
                    info!("Connection test finished with {}", status);
                    return Ok(status.is_success());
                }
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                    continue;
                }
                Err(e) => {
                    error!("Connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }

        Err(DimseError::operation_failed("Connection test failed after all retries"))
    }
}

/// Builder for creating SCU instances with custom configurations
pub struct ScuBuilder {
    config: DimseConfig,
}

impl ScuBuilder {
    /// Start building a new SCU
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
        }
    }

    /// Start from an existing node configuration
    pub fn from_config(config: DimseConfig) -> Self {
        Self { config }
    }

    /// Set the local AE title
    pub fn ae_title(mut self, aet: impl Into<String>) -> Self {
        self.config.ae_title = aet.into();
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the ACSE timeout
    pub fn acse_timeout(mut self, timeout: Duration) -> Self {
        self.config.acse_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the maximum PDU size
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Build the SCU
    pub fn build(self) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(DimseScu::new(self.config))
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}
