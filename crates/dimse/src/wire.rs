//! Upper-layer PDU plumbing on top of `dicom-ul`
//!
//! Frames PDUs on async byte streams for the listener, converts inbound
//! association PDUs to and from the negotiator's model, and splits/reassembles
//! DIMSE messages carried in P-DATA-TF. Outbound associations are set up by
//! `dicom_ul::association::ClientAssociationOptions` instead.

use bytes::BytesMut;
use dicom_ul::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::association::{ContextResult, NegotiatedContext, PresentationContextProposal, RoleProposal};
use crate::command::{CommandSet, DimseMessage};
use crate::negotiator::{AssociationRequest, RejectReason};
use crate::uids;
use crate::{DimseError, Result};

/// PDU type, reserved byte and 32-bit length
const PDU_HEADER_LEN: usize = 6;
/// Item length, presentation context ID and message control header of a PDV
const PDV_HEADER_LEN: u32 = 6;
/// Upper bound for any single PDU body we are willing to buffer
const MAX_PDU_BODY: usize = 4 * 1024 * 1024;
/// SCP/SCU Role Selection sub-item
const ROLE_SELECTION_ITEM: u8 = 0x54;

/// Read one complete PDU
pub async fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PDU_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let body_len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if body_len > MAX_PDU_BODY {
        return Err(DimseError::protocol(format!(
            "PDU of {} bytes exceeds the accepted maximum",
            body_len
        )));
    }

    let mut buf = BytesMut::with_capacity(PDU_HEADER_LEN + body_len);
    buf.extend_from_slice(&header);
    buf.resize(PDU_HEADER_LEN + body_len, 0);
    reader.read_exact(&mut buf[PDU_HEADER_LEN..]).await?;

    dicom_ul::pdu::read_pdu(&mut buf, max_pdu_length, false)
        .map_err(|e| DimseError::DicomUl(e.to_string()))?
        .ok_or_else(|| DimseError::protocol("Incomplete PDU"))
}

/// Encode and write one PDU
pub async fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = Vec::new();
    dicom_ul::pdu::write_pdu(&mut bytes, pdu).map_err(|e| DimseError::DicomUl(e.to_string()))?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Extract the negotiation-relevant parts of an A-ASSOCIATE-RQ
pub fn association_request(rq: &AssociationRQ) -> AssociationRequest {
    let mut request = AssociationRequest {
        application_context_name: rq.application_context_name.clone(),
        calling_ae_title: rq.calling_ae_title.trim().to_string(),
        called_ae_title: rq.called_ae_title.trim().to_string(),
        ..Default::default()
    };

    let mut roles = Vec::new();
    for item in &rq.user_variables {
        match item {
            UserVariableItem::MaxLength(len) => request.max_pdu_length = *len,
            UserVariableItem::ImplementationClassUID(uid) => {
                request.implementation_class_uid = uid.clone()
            }
            UserVariableItem::ImplementationVersionName(name) => {
                request.implementation_version_name = Some(name.trim().to_string())
            }
            UserVariableItem::Unknown(ROLE_SELECTION_ITEM, data) => {
                if let Some(role) = parse_role_selection(data) {
                    roles.push(role);
                }
            }
            _ => {}
        }
    }

    request.presentation_contexts = rq
        .presentation_contexts
        .iter()
        .map(|pc| {
            let abstract_syntax = uids::trim_uid(&pc.abstract_syntax).to_string();
            let role = roles
                .iter()
                .find(|(uid, _)| *uid == abstract_syntax)
                .map(|(_, role)| *role);
            PresentationContextProposal {
                id: pc.id,
                abstract_syntax,
                transfer_syntaxes: pc
                    .transfer_syntaxes
                    .iter()
                    .map(|ts| uids::trim_uid(ts).to_string())
                    .collect(),
                role,
            }
        })
        .collect();

    request
}

/// A-ASSOCIATE-AC answering `rq` with the negotiated contexts
pub fn association_ac(rq: &AssociationRQ, contexts: &[NegotiatedContext], max_pdu_length: u32) -> Pdu {
    let mut user_variables = vec![
        UserVariableItem::MaxLength(max_pdu_length),
        UserVariableItem::ImplementationClassUID(uids::IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
    ];

    // Role selection is only answered for syntaxes the requestor asked about
    let proposed_roles: Vec<String> = rq
        .user_variables
        .iter()
        .filter_map(|item| match item {
            UserVariableItem::Unknown(ROLE_SELECTION_ITEM, data) => {
                parse_role_selection(data).map(|(uid, _)| uid)
            }
            _ => None,
        })
        .collect();
    for pc in contexts.iter().filter(|pc| pc.is_accepted()) {
        if proposed_roles.contains(&pc.abstract_syntax) {
            let (scu, scp) = pc.role.requestor_roles();
            user_variables.push(UserVariableItem::Unknown(
                ROLE_SELECTION_ITEM,
                encode_role_selection(&pc.abstract_syntax, scu, scp),
            ));
        }
    }

    Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: match pc.result {
                    ContextResult::Accepted => PresentationContextResultReason::Acceptance,
                    ContextResult::AbstractSyntaxNotSupported => {
                        PresentationContextResultReason::AbstractSyntaxNotSupported
                    }
                    ContextResult::TransferSyntaxesNotSupported => {
                        PresentationContextResultReason::TransferSyntaxesNotSupported
                    }
                    ContextResult::Rejected => PresentationContextResultReason::NoReason,
                },
                transfer_syntax: pc.transfer_syntax.clone(),
            })
            .collect(),
        user_variables,
    })
}

/// A-ASSOCIATE-RJ carrying the ACSE codes of `reason`
pub fn association_rj(reason: RejectReason) -> Pdu {
    let (result, source) = match reason {
        RejectReason::BadApplicationContext => (
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        ),
        RejectReason::MissingImplementationUid | RejectReason::ShutdownRequested => (
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
        ),
        RejectReason::CalledAeTitleNotRecognized => (
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        ),
        RejectReason::TooManyAssociations => (
            AssociationRJResult::Transient,
            AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
        ),
    };
    Pdu::AssociationRJ(AssociationRJ { result, source })
}

/// A-ABORT sent by this node
pub fn abort() -> Pdu {
    Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    }
}

/// Split a message into P-DATA-TF PDUs that fit the peer's maximum PDU length
pub fn fragment_message(message: &DimseMessage, peer_max_pdu_length: u32) -> Result<Vec<Pdu>> {
    let chunk_len = if peer_max_pdu_length == 0 {
        usize::MAX
    } else {
        peer_max_pdu_length.saturating_sub(PDV_HEADER_LEN).max(1) as usize
    };

    let command = message.command.encode()?;
    let mut pdus = fragments(
        message.presentation_context_id,
        PDataValueType::Command,
        &command,
        chunk_len,
    );
    if let Some(data) = &message.data {
        pdus.extend(fragments(
            message.presentation_context_id,
            PDataValueType::Data,
            data,
            chunk_len,
        ));
    }
    Ok(pdus)
}

fn fragments(presentation_context_id: u8, value_type: PDataValueType, bytes: &[u8], chunk_len: usize) -> Vec<Pdu> {
    if bytes.is_empty() {
        return vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        }];
    }
    let count = bytes.len().div_ceil(chunk_len);
    bytes
        .chunks(chunk_len)
        .enumerate()
        .map(|(i, chunk)| Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: value_type.clone(),
                is_last: i + 1 == count,
                data: chunk.to_vec(),
            }],
        })
        .collect()
}

/// Reassembles command and data fragments into complete messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command_bytes: Vec<u8>,
    command: Option<CommandSet>,
    data: Vec<u8>,
}

impl MessageAssembler {
    /// Feed one PDV; returns a message once its last fragment has arrived
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match self.presentation_context_id {
            Some(id) if id != pdv.presentation_context_id => {
                return Err(DimseError::protocol(format!(
                    "Fragment for context {} interleaved with a message on context {}",
                    pdv.presentation_context_id, id
                )));
            }
            _ => self.presentation_context_id = Some(pdv.presentation_context_id),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                if self.command.is_some() {
                    return Err(DimseError::protocol("Command fragment received while expecting data"));
                }
                self.command_bytes.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = CommandSet::decode(&self.command_bytes)?;
                self.command_bytes.clear();
                if command.has_dataset {
                    self.command = Some(command);
                    return Ok(None);
                }
                Ok(Some(self.finish(command, None)))
            }
            PDataValueType::Data => {
                let Some(command) = self.command.take() else {
                    return Err(DimseError::protocol("Data fragment received before its command"));
                };
                self.data.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    self.command = Some(command);
                    return Ok(None);
                }
                let data = std::mem::take(&mut self.data);
                Ok(Some(self.finish(command, Some(data))))
            }
        }
    }

    fn finish(&mut self, command: CommandSet, data: Option<Vec<u8>>) -> DimseMessage {
        let presentation_context_id = self.presentation_context_id.take().unwrap_or_default();
        DimseMessage {
            presentation_context_id,
            command,
            data,
        }
    }
}

fn parse_role_selection(data: &[u8]) -> Option<(String, RoleProposal)> {
    let uid_len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let uid = data.get(2..2 + uid_len)?;
    let scu = *data.get(2 + uid_len)? == 1;
    let scp = *data.get(3 + uid_len)? == 1;
    let uid = uids::trim_uid(std::str::from_utf8(uid).ok()?).to_string();
    Some((uid, RoleProposal { scu, scp }))
}

fn encode_role_selection(abstract_syntax: &str, scu: bool, scp: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(abstract_syntax.len() + 4);
    data.extend_from_slice(&(abstract_syntax.len() as u16).to_be_bytes());
    data.extend_from_slice(abstract_syntax.as_bytes());
    data.push(scu as u8);
    data.push(scp as u8);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::LocalRole;
    use crate::types::{CommandField, DimseStatus};
    use dicom_ul::pdu::PresentationContextProposed;

    fn rq_with_role() -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORESCU".to_string(),
            called_ae_title: "DIMSE_NODE".to_string(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2\0".to_string(),
                transfer_syntaxes: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
            }],
            user_variables: vec![
                UserVariableItem::MaxLength(32768),
                UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
                UserVariableItem::Unknown(
                    ROLE_SELECTION_ITEM,
                    encode_role_selection("1.2.840.10008.5.1.4.1.1.2", false, true),
                ),
            ],
        }
    }

    #[test]
    fn test_association_request_conversion() {
        let request = association_request(&rq_with_role());
        assert_eq!(request.calling_ae_title, "STORESCU");
        assert_eq!(request.max_pdu_length, 32768);
        assert_eq!(request.implementation_class_uid, "1.2.3.4");
        let pc = &request.presentation_contexts[0];
        assert_eq!(pc.abstract_syntax, "1.2.840.10008.5.1.4.1.1.2");
        assert_eq!(pc.role, Some(RoleProposal { scu: false, scp: true }));
    }

    #[test]
    fn test_ac_echoes_role_selection() {
        let rq = rq_with_role();
        let contexts = vec![NegotiatedContext::accepted(
            1,
            "1.2.840.10008.5.1.4.1.1.2",
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
            LocalRole::Scu,
        )];
        let Pdu::AssociationAC(ac) = association_ac(&rq, &contexts, 16384) else {
            panic!("expected A-ASSOCIATE-AC");
        };
        assert!(ac.user_variables.iter().any(|item| matches!(
            item,
            UserVariableItem::Unknown(ROLE_SELECTION_ITEM, data)
                if parse_role_selection(data).map(|(_, r)| r) == Some(RoleProposal { scu: false, scp: true })
        )));
    }

    #[test]
    fn test_rejection_matches_acse_codes() {
        for reason in [
            RejectReason::BadApplicationContext,
            RejectReason::MissingImplementationUid,
            RejectReason::CalledAeTitleNotRecognized,
            RejectReason::TooManyAssociations,
        ] {
            let Pdu::AssociationRJ(rj) = association_rj(reason) else {
                panic!("expected A-ASSOCIATE-RJ");
            };
            let codes = reason.acse_codes();
            let result = match rj.result {
                AssociationRJResult::Permanent => 1,
                AssociationRJResult::Transient => 2,
            };
            assert_eq!(result, codes.result, "{:?}", reason);
        }
    }

    #[tokio::test]
    async fn test_pdu_framing_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let rq = Pdu::AssociationRQ(AssociationRQ {
            called_ae_title: "SCP".to_string(),
            ..rq_with_role()
        });
        write_pdu(&mut client, &rq).await.unwrap();
        write_pdu(&mut client, &Pdu::ReleaseRQ).await.unwrap();

        match read_pdu(&mut server, 16384).await.unwrap() {
            Pdu::AssociationRQ(rq) => {
                let request = association_request(&rq);
                assert_eq!(request.called_ae_title, "SCP");
                assert_eq!(request.implementation_class_uid, "1.2.3.4");
                assert_eq!(request.presentation_contexts.len(), 1);
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert!(matches!(read_pdu(&mut server, 16384).await.unwrap(), Pdu::ReleaseRQ));
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let request = CommandSet::request(CommandField::CStoreRq, 9, "1.2.840.10008.5.1.4.1.1.7");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let message = DimseMessage::new(3, request).with_data(payload.clone());

        let pdus = fragment_message(&message, 4096).unwrap();
        assert!(pdus.len() >= 4);

        let mut assembler = MessageAssembler::default();
        let mut reassembled = None;
        for pdu in pdus {
            let Pdu::PData { data } = pdu else {
                panic!("expected P-DATA-TF");
            };
            for pdv in data {
                assert!(pdv.data.len() as u32 + PDV_HEADER_LEN <= 4096);
                if let Some(done) = assembler.push(pdv).unwrap() {
                    reassembled = Some(done);
                }
            }
        }
        let reassembled = reassembled.expect("message completed");
        assert_eq!(reassembled.presentation_context_id, 3);
        assert_eq!(reassembled.command.message_id, Some(9));
        assert_eq!(reassembled.data, Some(payload));
    }

    #[test]
    fn test_data_before_command_is_rejected() {
        let mut assembler = MessageAssembler::default();
        let result = assembler.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8],
        });
        assert!(result.is_err());

        let response = CommandSet::response_to(
            &CommandSet::request(CommandField::CEchoRq, 1, uids::VERIFICATION),
            DimseStatus::Success,
        )
        .unwrap();
        let pdus = fragment_message(&DimseMessage::new(1, response), 0).unwrap();
        assert_eq!(pdus.len(), 1);
    }
}
