mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::{
    uids, CommandField, CommandSet, DimseChannel, DimseMessage, DimseStatus, EchoHandler,
    FindHandler, Incoming, MatchProvider, MatchQuery, ProviderError, RetrievedDataset,
    ServiceRegistry, RetrieveSink,
};
use dimse_node::index::FolderIndex;
use dimse_node::storage::FilesystemStorage;
use futures_util::StreamExt;

use common::{local_config, scu, shutdown, start_listener, study, study_query, text, FixedProvider};

fn find_registry(provider: impl MatchProvider + 'static) -> ServiceRegistry {
    ServiceRegistry::builder()
        .register(EchoHandler)
        .unwrap()
        .register(FindHandler::new(Arc::new(provider)))
        .unwrap()
        .build()
}

#[tokio::test]
async fn find_three_matches() {
    let provider = FixedProvider {
        candidates: vec![
            study("1.2.3.1", "DOE^JANE"),
            study("1.2.3.2", "DOE^JOHN"),
            study("1.2.3.3", "ROE^RICHARD"),
        ],
    };
    let (listener, node) = start_listener(local_config("QR_SCP"), find_registry(provider)).await;

    let mut client = scu("FIND_SCU");
    let matches: Vec<InMemDicomObject> = client
        .find(&node, uids::STUDY_ROOT_FIND, &study_query())
        .await
        .expect("C-FIND starts")
        .map(|found| found.expect("match decodes"))
        .collect()
        .await;

    let studies: Vec<String> = matches.iter().map(|m| text(m, tags::STUDY_INSTANCE_UID)).collect();
    assert_eq!(studies, vec!["1.2.3.1", "1.2.3.2", "1.2.3.3"]);
    for found in &matches {
        assert_eq!(text(found, tags::RETRIEVE_AE_TITLE), "QR_SCP");
    }

    shutdown(listener).await;
}

#[tokio::test]
async fn find_with_no_matches() {
    let provider = FixedProvider { candidates: vec![] };
    let (listener, node) = start_listener(local_config("QR_SCP"), find_registry(provider)).await;

    let mut client = scu("FIND_SCU");
    let stream = client
        .find(&node, uids::STUDY_ROOT_FIND, &study_query())
        .await
        .expect("C-FIND starts");
    let results: Vec<_> = stream.collect().await;
    assert!(results.is_empty(), "expected no results, got {}", results.len());

    shutdown(listener).await;
}

/// Produces up to `total` candidates, slowly enough for a cancel to land mid-query
struct SlowProvider {
    total: usize,
    produced: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

struct SlowQuery {
    remaining: usize,
    produced: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl MatchProvider for SlowProvider {
    async fn start_query(
        &self,
        _abstract_syntax: &str,
        _identifier: &InMemDicomObject,
    ) -> Result<Box<dyn MatchQuery>, ProviderError> {
        Ok(Box::new(SlowQuery {
            remaining: self.total,
            produced: self.produced.clone(),
            cancelled: self.cancelled.clone(),
        }))
    }
}

#[async_trait]
impl MatchQuery for SlowQuery {
    async fn next(&mut self) -> Result<Option<InMemDicomObject>, ProviderError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.remaining -= 1;
        let n = self.produced.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(study(&format!("1.2.3.{}", n), "DOE^JANE")))
    }

    async fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn find_cancelled_mid_query() {
    const TOTAL: usize = 200;
    let produced = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));
    let provider = SlowProvider {
        total: TOTAL,
        produced: produced.clone(),
        cancelled: cancelled.clone(),
    };
    let (listener, node) = start_listener(local_config("QR_SCP"), find_registry(provider)).await;

    let client = scu("FIND_SCU");
    let mut assoc = client
        .open(&node, &[uids::STUDY_ROOT_FIND])
        .await
        .expect("association accepted");
    let context = assoc
        .association()
        .context_for(uids::STUDY_ROOT_FIND)
        .expect("find context accepted")
        .clone();

    let message_id = 7;
    let request = DimseMessage::new(
        context.id,
        CommandSet::request(CommandField::CFindRq, message_id, uids::STUDY_ROOT_FIND),
    )
    .with_dataset(&study_query(), &context.transfer_syntax)
    .unwrap();
    assoc.channel().send(request).await.unwrap();

    let mut pending = 0usize;
    let final_status = loop {
        let message = match assoc.channel().receive().await.expect("response arrives") {
            Incoming::Message(message) => message,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(message.command.message_id_being_responded_to, Some(message_id));
        let status = message.command.dimse_status().expect("status present");
        if status.is_pending() {
            pending += 1;
            if pending == 1 {
                let cancel = DimseMessage::new(context.id, CommandSet::cancel(message_id));
                assoc.channel().send(cancel).await.unwrap();
            }
            continue;
        }
        assert!(message.data.is_none(), "final response carries no identifier");
        break status;
    };

    assert_eq!(final_status, DimseStatus::Cancel);
    assert!(pending < TOTAL, "cancel arrived after {} matches", pending);
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(produced.load(Ordering::SeqCst), pending);

    assoc.release().await;
    shutdown(listener).await;
}

#[tokio::test]
async fn find_over_folder_archive() {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = FilesystemStorage::new(dir.path()).expect("storage");
    for (study_uid, name) in [("1.2.840.1", "DOE^JANE"), ("1.2.840.2", "ROE^RICHARD")] {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.2")));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(format!("{}.1.1", study_uid)),
        ));
        obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(format!("{}.1", study_uid)),
        ));
        obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(name)));
        storage
            .store(RetrievedDataset {
                sop_class_uid: String::new(),
                sop_instance_uid: String::new(),
                transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                dataset: obj,
            })
            .await
            .expect("store fixture");
    }

    let index = FolderIndex::new(storage.base_path());
    let (listener, node) = start_listener(local_config("QR_SCP"), find_registry(index)).await;

    let mut client = scu("FIND_SCU");
    let matches: Vec<InMemDicomObject> = client
        .find(&node, uids::STUDY_ROOT_FIND, &study("", "DOE*"))
        .await
        .expect("C-FIND starts")
        .map(|found| found.expect("match decodes"))
        .collect()
        .await;

    assert_eq!(matches.len(), 1);
    assert_eq!(text(&matches[0], tags::STUDY_INSTANCE_UID), "1.2.840.1");
    assert_eq!(text(&matches[0], tags::PATIENT_NAME), "DOE^JANE");

    shutdown(listener).await;
}
