#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::provider::VecQuery;
use dimse::{
    AssociationListener, DimseConfig, DimseScu, MatchProvider, MatchQuery, ProviderError,
    RemoteNode, ServiceRegistry,
};

/// Loopback config on an ephemeral port with a short accept poll
pub fn local_config(ae_title: &str) -> DimseConfig {
    DimseConfig {
        ae_title: ae_title.to_string(),
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        accept_poll_ms: 50,
        acse_timeout_secs: 5,
        connect_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// Start a listener and describe it as a remote node
pub async fn start_listener(config: DimseConfig, registry: ServiceRegistry) -> (AssociationListener, RemoteNode) {
    let ae_title = config.ae_title.clone();
    let listener = AssociationListener::new(config, registry).expect("valid listener config");
    let addr = listener.start().await.expect("listener starts");
    let node = RemoteNode::new(ae_title, "127.0.0.1", addr.port());
    (listener, node)
}

pub async fn shutdown(listener: AssociationListener) {
    listener.stop();
    listener.join().await;
}

pub fn scu(ae_title: &str) -> DimseScu {
    DimseScu::new(local_config(ae_title))
}

pub fn study(study_uid: &str, patient_name: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from("STUDY")));
    obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)));
    obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(patient_name)));
    obj
}

pub fn study_query() -> InMemDicomObject {
    study("", "")
}

/// Answers every query with the same candidates
pub struct FixedProvider {
    pub candidates: Vec<InMemDicomObject>,
}

#[async_trait]
impl MatchProvider for FixedProvider {
    async fn start_query(
        &self,
        _abstract_syntax: &str,
        _identifier: &InMemDicomObject,
    ) -> Result<Box<dyn MatchQuery>, ProviderError> {
        Ok(Box::new(VecQuery::new(self.candidates.clone())))
    }
}

pub fn text(obj: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .unwrap_or_default()
}
