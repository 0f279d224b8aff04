//! DIMSE command sets and messages
//!
//! A [`DimseMessage`] is one complete command (plus its optional data set) as
//! reassembled from P-DATA fragments. Command sets are always encoded in
//! Implicit VR Little Endian; data sets use the transfer syntax negotiated for
//! the presentation context the message travels on.

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::types::{CommandField, DimseStatus, Priority};
use crate::uids;
use crate::{DimseError, Result};

const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);
const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
const PRIORITY: Tag = Tag(0x0000, 0x0700);
const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
const STATUS: Tag = Tag(0x0000, 0x0900);
const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
const REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
const COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
const FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
const WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);
const MOVE_ORIGINATOR_AE_TITLE: Tag = Tag(0x0000, 0x1030);
const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);

/// CommandDataSetType value meaning "no data set follows"
const NO_DATA_SET: u16 = 0x0101;

/// Sub-operation counters of C-MOVE / C-GET responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// Typed view of a DIMSE command set
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    pub command_field: CommandField,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub priority: Option<Priority>,
    pub has_dataset: bool,
    pub status: Option<u16>,
    pub error_comment: Option<String>,
    pub move_destination: Option<String>,
    pub sub_operations: Option<SubOperations>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
}

impl CommandSet {
    fn empty(command_field: CommandField) -> Self {
        Self {
            command_field,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            message_id: None,
            message_id_being_responded_to: None,
            priority: None,
            has_dataset: false,
            status: None,
            error_comment: None,
            move_destination: None,
            sub_operations: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
        }
    }

    /// New request command
    pub fn request(command_field: CommandField, message_id: u16, sop_class_uid: impl Into<String>) -> Self {
        let mut command = Self::empty(command_field);
        command.message_id = Some(message_id);
        command.affected_sop_class_uid = Some(sop_class_uid.into());
        if command_field != CommandField::CEchoRq {
            command.priority = Some(Priority::Medium);
        }
        command
    }

    /// C-CANCEL-RQ targeting an outstanding request
    pub fn cancel(message_id_being_responded_to: u16) -> Self {
        let mut command = Self::empty(CommandField::CCancelRq);
        command.message_id_being_responded_to = Some(message_id_being_responded_to);
        command
    }

    /// Response command for `request` carrying `status`
    pub fn response_to(request: &CommandSet, status: DimseStatus) -> Result<Self> {
        let command_field = request.command_field.response().ok_or_else(|| {
            DimseError::protocol(format!("{} has no response command", request.command_field))
        })?;
        let mut command = Self::empty(command_field);
        command.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        command.affected_sop_instance_uid = request.affected_sop_instance_uid.clone();
        command.message_id_being_responded_to = request.message_id;
        command.status = Some(status.code());
        Ok(command)
    }

    pub fn with_dataset(mut self) -> Self {
        self.has_dataset = true;
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        let mut comment = comment.into();
        // ErrorComment is LO: at most 64 bytes, cut on a char boundary
        let mut len = comment.len().min(64);
        while !comment.is_char_boundary(len) {
            len -= 1;
        }
        comment.truncate(len);
        self.error_comment = Some(comment);
        self
    }

    pub fn dimse_status(&self) -> Option<DimseStatus> {
        self.status.map(DimseStatus::from_code)
    }

    pub fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        if let Some(uid) = &self.affected_sop_class_uid {
            obj.put(DataElement::new(AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uid.as_str())));
        }
        obj.put(DataElement::new(
            COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(self.command_field.code()),
        ));
        put_u16(&mut obj, MESSAGE_ID, self.message_id);
        put_u16(
            &mut obj,
            MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(destination) = &self.move_destination {
            obj.put(DataElement::new(MOVE_DESTINATION, VR::AE, PrimitiveValue::from(destination.as_str())));
        }
        put_u16(&mut obj, PRIORITY, self.priority.map(|p| p.code()));
        obj.put(DataElement::new(
            COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(if self.has_dataset { 0x0000_u16 } else { NO_DATA_SET }),
        ));
        put_u16(&mut obj, STATUS, self.status);
        if let Some(comment) = &self.error_comment {
            obj.put(DataElement::new(ERROR_COMMENT, VR::LO, PrimitiveValue::from(comment.as_str())));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            obj.put(DataElement::new(AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(uid.as_str())));
        }
        if let Some(ops) = self.sub_operations {
            put_u16(&mut obj, REMAINING_SUBOPERATIONS, Some(ops.remaining));
            put_u16(&mut obj, COMPLETED_SUBOPERATIONS, Some(ops.completed));
            put_u16(&mut obj, FAILED_SUBOPERATIONS, Some(ops.failed));
            put_u16(&mut obj, WARNING_SUBOPERATIONS, Some(ops.warning));
        }
        if let Some(aet) = &self.move_originator_ae_title {
            obj.put(DataElement::new(MOVE_ORIGINATOR_AE_TITLE, VR::AE, PrimitiveValue::from(aet.as_str())));
        }
        put_u16(&mut obj, MOVE_ORIGINATOR_MESSAGE_ID, self.move_originator_message_id);
        obj
    }

    pub fn from_object(obj: &InMemDicomObject) -> Result<Self> {
        let code = read_u16(obj, COMMAND_FIELD)
            .ok_or_else(|| DimseError::protocol("command set without CommandField"))?;
        let mut command = Self::empty(CommandField::from_code(code));
        command.affected_sop_class_uid = read_str(obj, AFFECTED_SOP_CLASS_UID);
        command.affected_sop_instance_uid = read_str(obj, AFFECTED_SOP_INSTANCE_UID);
        command.message_id = read_u16(obj, MESSAGE_ID);
        command.message_id_being_responded_to = read_u16(obj, MESSAGE_ID_BEING_RESPONDED_TO);
        command.priority = read_u16(obj, PRIORITY).map(Priority::from_code);
        command.has_dataset = read_u16(obj, COMMAND_DATA_SET_TYPE)
            .map(|t| t != NO_DATA_SET)
            .unwrap_or(false);
        command.status = read_u16(obj, STATUS);
        command.error_comment = read_str(obj, ERROR_COMMENT);
        command.move_destination = read_str(obj, MOVE_DESTINATION);
        if let Some(remaining) = read_u16(obj, REMAINING_SUBOPERATIONS) {
            command.sub_operations = Some(SubOperations {
                remaining,
                completed: read_u16(obj, COMPLETED_SUBOPERATIONS).unwrap_or(0),
                failed: read_u16(obj, FAILED_SUBOPERATIONS).unwrap_or(0),
                warning: read_u16(obj, WARNING_SUBOPERATIONS).unwrap_or(0),
            });
        }
        command.move_originator_ae_title = read_str(obj, MOVE_ORIGINATOR_AE_TITLE);
        command.move_originator_message_id = read_u16(obj, MOVE_ORIGINATOR_MESSAGE_ID);
        Ok(command)
    }

    /// Encode as Implicit VR Little Endian, including CommandGroupLength
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut obj = self.to_object();
        let body = encode_dataset(&obj, uids::IMPLICIT_VR_LITTLE_ENDIAN)?;
        obj.put(DataElement::new(
            COMMAND_GROUP_LENGTH,
            VR::UL,
            PrimitiveValue::from(body.len() as u32),
        ));
        encode_dataset(&obj, uids::IMPLICIT_VR_LITTLE_ENDIAN)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let obj = decode_dataset(bytes, uids::IMPLICIT_VR_LITTLE_ENDIAN)?;
        Self::from_object(&obj)
    }
}

/// One complete DIMSE message: command set plus optional encoded data set
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    /// Data set bytes in the context's transfer syntax
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    pub fn new(presentation_context_id: u8, command: CommandSet) -> Self {
        Self {
            presentation_context_id,
            command,
            data: None,
        }
    }

    /// Attach an already encoded data set
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.command.has_dataset = true;
        self.data = Some(data);
        self
    }

    /// Attach a data set, encoding it with `transfer_syntax`
    pub fn with_dataset(self, dataset: &InMemDicomObject, transfer_syntax: &str) -> Result<Self> {
        let data = encode_dataset(dataset, transfer_syntax)?;
        Ok(self.with_data(data))
    }

    pub fn command_field(&self) -> CommandField {
        self.command.command_field
    }

    /// Decode the attached data set, if any
    pub fn dataset(&self, transfer_syntax: &str) -> Result<Option<InMemDicomObject>> {
        self.data
            .as_deref()
            .map(|bytes| decode_dataset(bytes, transfer_syntax))
            .transpose()
    }
}

/// Look up a transfer syntax in the registry
pub fn transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = uids::trim_uid(uid);
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DimseError::DicomParsing(format!("Unknown transfer syntax {}", uid)))
}

/// Whether data sets in this transfer syntax can be decoded and written back as-is
pub fn can_write(uid: &str) -> bool {
    transfer_syntax(uid)
        .map(|ts| !ts.is_unsupported())
        .unwrap_or(false)
}

pub fn encode_dataset(obj: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    let ts = transfer_syntax(transfer_syntax_uid)?;
    let mut bytes = Vec::new();
    obj.write_dataset_with_ts(&mut bytes, ts)
        .map_err(|e| DimseError::DicomObject(format!("Failed to encode data set: {}", e)))?;
    Ok(bytes)
}

pub fn decode_dataset(bytes: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    let ts = transfer_syntax(transfer_syntax_uid)?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(|e| DimseError::DicomParsing(format!("Failed to decode data set: {}", e)))
}

fn put_u16(obj: &mut InMemDicomObject, tag: Tag, value: Option<u16>) {
    if let Some(value) = value {
        obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    }
}

fn read_u16(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

fn read_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
}
