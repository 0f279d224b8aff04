mod common;

use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::command::SubOperations;
use dimse::{
    uids, CommandField, CommandSet, DimseChannel, DimseError, DimseMessage, DimseStatus,
    EchoHandler, Incoming, MoveIdentifier, RemoteNode, ServiceContext, ServiceHandler,
    ServiceRegistry, StoreHandler,
};
use dimse_node::storage::FilesystemStorage;

use common::{local_config, scu, shutdown, start_listener};

const CT: &str = "1.2.840.10008.5.1.4.1.1.2";
const STUDY: &str = "1.2.826.0.1.3680043.2.1";
const SERIES: &str = "1.2.826.0.1.3680043.2.1.1";
const SOP: &str = "1.2.826.0.1.3680043.2.1.1.1";

/// Move destination unknown
const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;

fn ct_instance() -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(CT)));
    obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(SOP)));
    obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(STUDY)));
    obj.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(SERIES)));
    obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JANE")));
    obj
}

/// Minimal C-MOVE SCP: stores one instance at the known destination,
/// or returns it inside the move responses
struct ForwardingMove {
    destination: RemoteNode,
    instance: InMemDicomObject,
    inline: bool,
}

impl ForwardingMove {
    async fn store_to_destination(&self) -> dimse::Result<bool> {
        let client = scu("QR_SCP");
        let mut assoc = client.open(&self.destination, &[CT]).await?;
        let context = assoc
            .association()
            .context_for(CT)
            .cloned()
            .ok_or_else(|| DimseError::operation_failed("storage context refused"))?;

        let mut store = CommandSet::request(CommandField::CStoreRq, 1, CT);
        store.affected_sop_instance_uid = Some(SOP.to_string());
        let message = DimseMessage::new(context.id, store).with_dataset(&self.instance, &context.transfer_syntax)?;
        assoc.channel().send(message).await?;

        let status = match assoc.channel().receive().await? {
            Incoming::Message(response) => response.command.dimse_status(),
            _ => None,
        };
        assoc.release().await;
        Ok(status == Some(DimseStatus::Success))
    }
}

#[async_trait]
impl ServiceHandler for ForwardingMove {
    fn command(&self) -> CommandField {
        CommandField::CMoveRq
    }

    async fn handle(
        &self,
        ctx: &ServiceContext,
        request: DimseMessage,
        channel: &mut dyn DimseChannel,
    ) -> dimse::Result<()> {
        let pcid = request.presentation_context_id;
        let destination = request.command.move_destination.clone().unwrap_or_default();
        if destination.trim() != self.destination.ae_title {
            let refused = CommandSet::response_to(
                &request.command,
                DimseStatus::from_code(MOVE_DESTINATION_UNKNOWN),
            )?;
            return channel.send(DimseMessage::new(pcid, refused)).await;
        }

        let mut ops = SubOperations::default();
        if self.inline {
            let transfer_syntax = ctx.transfer_syntax(pcid)?.to_string();
            let mut pending = CommandSet::response_to(&request.command, DimseStatus::Pending)?;
            pending.sub_operations = Some(SubOperations {
                completed: 1,
                ..Default::default()
            });
            let message = DimseMessage::new(pcid, pending).with_dataset(&self.instance, &transfer_syntax)?;
            channel.send(message).await?;
            ops.completed = 1;
        } else {
            match self.store_to_destination().await {
                Ok(true) => ops.completed += 1,
                _ => ops.failed += 1,
            }
        }

        let mut done = CommandSet::response_to(&request.command, DimseStatus::Success)?;
        done.sub_operations = Some(ops);
        channel.send(DimseMessage::new(pcid, done)).await
    }
}

async fn start_pacs(destination: RemoteNode, inline: bool) -> (dimse::AssociationListener, RemoteNode) {
    let registry = ServiceRegistry::builder()
        .register(EchoHandler)
        .unwrap()
        .register(ForwardingMove {
            destination,
            instance: ct_instance(),
            inline,
        })
        .unwrap()
        .build();
    start_listener(local_config("QR_SCP"), registry).await
}

#[tokio::test]
async fn move_delivers_to_local_store_listener() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = FilesystemStorage::new(dir.path()).expect("storage");
    let dest_registry = ServiceRegistry::builder()
        .register(StoreHandler::new(Arc::new(storage.clone())))
        .unwrap()
        .build();
    let (dest_listener, dest_node) = start_listener(local_config("MOVE_DEST"), dest_registry).await;
    let (pacs_listener, pacs_node) = start_pacs(dest_node, false).await;

    let mut client = scu("MOVE_DEST");
    let summary = client
        .retrieve(&pacs_node, "MOVE_DEST", &MoveIdentifier::study(STUDY), &storage)
        .await
        .expect("C-MOVE completes");

    assert!(summary.is_success(), "summary: {:?}", summary);
    assert_eq!(summary.sub_operations.completed, 1);
    assert_eq!(summary.sub_operations.failed, 0);
    assert_eq!(summary.datasets_stored, 0);

    let stored = storage.path_for(STUDY, SERIES, SOP);
    assert!(stored.is_file(), "missing {}", stored.display());
    let file = dicom_object::open_file(&stored).expect("open stored instance");
    let name = file.element(tags::PATIENT_NAME).unwrap().to_str().unwrap();
    assert_eq!(name.trim(), "DOE^JANE");

    shutdown(pacs_listener).await;
    shutdown(dest_listener).await;
}

#[tokio::test]
async fn move_response_datasets_go_to_sink() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = FilesystemStorage::new(dir.path()).expect("storage");
    let (pacs_listener, pacs_node) =
        start_pacs(RemoteNode::new("MOVE_DEST", "127.0.0.1", 1), true).await;

    let mut client = scu("MOVE_DEST");
    let summary = client
        .retrieve(
            &pacs_node,
            "MOVE_DEST",
            &MoveIdentifier::series(STUDY, SERIES),
            &storage,
        )
        .await
        .expect("C-MOVE completes");

    assert!(summary.is_success());
    assert_eq!(summary.responses, 2);
    assert_eq!(summary.datasets_stored, 1);
    assert_eq!(summary.datasets_failed, 0);
    assert!(storage.path_for(STUDY, SERIES, SOP).is_file());

    shutdown(pacs_listener).await;
}

#[tokio::test]
async fn move_to_unknown_destination_fails() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = FilesystemStorage::new(dir.path()).expect("storage");
    let (pacs_listener, pacs_node) =
        start_pacs(RemoteNode::new("MOVE_DEST", "127.0.0.1", 1), false).await;

    let mut client = scu("MOVE_SCU");
    let summary = client
        .retrieve(&pacs_node, "ELSEWHERE", &MoveIdentifier::study(STUDY), &storage)
        .await
        .expect("C-MOVE answered");

    assert!(!summary.is_success());
    assert_eq!(summary.status, Some(DimseStatus::from_code(MOVE_DESTINATION_UNKNOWN)));
    assert_eq!(summary.datasets_stored, 0);

    shutdown(pacs_listener).await;
}
