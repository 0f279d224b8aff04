//! Inbound association negotiation
//!
//! Decides, for an A-ASSOCIATE-RQ already decoded from the wire, whether the
//! association is accepted and which presentation contexts (abstract syntax,
//! transfer syntax, role) are granted. Rejections always carry a standard
//! ACSE result/source/reason triple so the peer gets a conformant A-ASSOCIATE-RJ.

use tracing::{debug, warn};

use crate::association::{
    ContextResult, LocalRole, NegotiatedContext, PresentationContextProposal,
};
use crate::config::DimseConfig;
use crate::uids;

/// Decoded A-ASSOCIATE-RQ parameters relevant to negotiation
#[derive(Debug, Clone, Default)]
pub struct AssociationRequest {
    pub application_context_name: String,
    /// Empty when the requestor sent no Implementation Class UID sub-item
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// Maximum PDU length the requestor accepts (0 = unlimited)
    pub max_pdu_length: u32,
    pub presentation_contexts: Vec<PresentationContextProposal>,
}

/// Why an association request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BadApplicationContext,
    MissingImplementationUid,
    CalledAeTitleNotRecognized,
    TooManyAssociations,
    /// Refusal sent to a peer that asked the server to shut down
    ShutdownRequested,
}

/// ACSE result/source/reason triple of an A-ASSOCIATE-RJ (PS3.8 Table 9-21)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcseRejection {
    /// 1 = rejected-permanent, 2 = rejected-transient
    pub result: u8,
    /// 1 = service-user, 2 = service-provider (ACSE), 3 = service-provider (presentation)
    pub source: u8,
    pub reason: u8,
}

impl RejectReason {
    pub fn acse_codes(&self) -> AcseRejection {
        match self {
            RejectReason::BadApplicationContext => AcseRejection {
                result: 1,
                source: 1,
                reason: 2,
            },
            RejectReason::MissingImplementationUid | RejectReason::ShutdownRequested => {
                AcseRejection {
                    result: 1,
                    source: 1,
                    reason: 1,
                }
            }
            RejectReason::CalledAeTitleNotRecognized => AcseRejection {
                result: 1,
                source: 1,
                reason: 7,
            },
            RejectReason::TooManyAssociations => AcseRejection {
                result: 2,
                source: 3,
                reason: 2,
            },
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::BadApplicationContext => write!(f, "application context name not supported"),
            RejectReason::MissingImplementationUid => write!(f, "no implementation class UID provided"),
            RejectReason::CalledAeTitleNotRecognized => write!(f, "called AE title not recognized"),
            RejectReason::TooManyAssociations => write!(f, "too many associations"),
            RejectReason::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

/// Successful negotiation results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Accepted(Vec<NegotiatedContext>),
    /// The private shutdown SOP class was negotiated; the caller refuses the
    /// association and stops the listener
    ShutdownRequested(Vec<NegotiatedContext>),
}

impl NegotiationOutcome {
    pub fn contexts(&self) -> &[NegotiatedContext] {
        match self {
            NegotiationOutcome::Accepted(contexts)
            | NegotiationOutcome::ShutdownRequested(contexts) => contexts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Always,
    PatientRoot,
    StudyRoot,
    PatientStudyOnly,
    Shutdown,
}

/// Non-storage abstract syntaxes this node knows about, with the flag that enables each
const SERVICE_SYNTAXES: [(&str, Gate); 11] = [
    (uids::VERIFICATION, Gate::Always),
    (uids::PATIENT_ROOT_FIND, Gate::PatientRoot),
    (uids::PATIENT_ROOT_MOVE, Gate::PatientRoot),
    (uids::PATIENT_ROOT_GET, Gate::PatientRoot),
    (uids::STUDY_ROOT_FIND, Gate::StudyRoot),
    (uids::STUDY_ROOT_MOVE, Gate::StudyRoot),
    (uids::STUDY_ROOT_GET, Gate::StudyRoot),
    (uids::PATIENT_STUDY_ONLY_FIND, Gate::PatientStudyOnly),
    (uids::PATIENT_STUDY_ONLY_MOVE, Gate::PatientStudyOnly),
    (uids::PATIENT_STUDY_ONLY_GET, Gate::PatientStudyOnly),
    (uids::PRIVATE_SHUTDOWN, Gate::Shutdown),
];

/// Validates association requests against the service-class flags of a node
#[derive(Debug, Clone)]
pub struct AssociationNegotiator {
    ae_title: String,
    enable_get: bool,
    enable_patient_root: bool,
    enable_study_root: bool,
    enable_patient_study_only: bool,
    allow_shutdown: bool,
    accept_unknown_syntaxes: bool,
    check_called_ae_title: bool,
}

impl AssociationNegotiator {
    pub fn new(config: &DimseConfig) -> Self {
        Self {
            ae_title: config.ae_title.clone(),
            enable_get: config.enable_get,
            enable_patient_root: config.enable_patient_root,
            enable_study_root: config.enable_study_root,
            enable_patient_study_only: config.enable_patient_study_only,
            allow_shutdown: config.allow_shutdown,
            accept_unknown_syntaxes: config.accept_unknown_syntaxes,
            check_called_ae_title: config.check_called_ae_title,
        }
    }

    /// Non-storage abstract syntaxes enabled by the current flags
    pub fn enabled_service_syntaxes(&self) -> Vec<&'static str> {
        SERVICE_SYNTAXES
            .iter()
            .filter(|(uid, gate)| {
                self.gate_open(*gate) && (self.enable_get || !uids::is_get_sop_class(uid))
            })
            .map(|(uid, _)| *uid)
            .collect()
    }

    fn gate_open(&self, gate: Gate) -> bool {
        match gate {
            Gate::Always => true,
            Gate::PatientRoot => self.enable_patient_root,
            Gate::StudyRoot => self.enable_study_root,
            Gate::PatientStudyOnly => self.enable_patient_study_only,
            Gate::Shutdown => self.allow_shutdown,
        }
    }

    fn is_known_service_syntax(uid: &str) -> bool {
        SERVICE_SYNTAXES.iter().any(|(known, _)| *known == uid)
    }

    /// Negotiate an inbound association request
    pub fn negotiate(
        &self,
        request: &AssociationRequest,
    ) -> std::result::Result<NegotiationOutcome, RejectReason> {
        if uids::trim_uid(&request.application_context_name) != uids::APPLICATION_CONTEXT_NAME {
            return Err(RejectReason::BadApplicationContext);
        }

        if uids::trim_uid(&request.implementation_class_uid).is_empty() {
            return Err(RejectReason::MissingImplementationUid);
        }

        if self.check_called_ae_title && request.called_ae_title.trim() != self.ae_title.trim() {
            return Err(RejectReason::CalledAeTitleNotRecognized);
        }

        let enabled = self.enabled_service_syntaxes();
        let contexts: Vec<NegotiatedContext> = request
            .presentation_contexts
            .iter()
            .map(|proposal| self.negotiate_context(proposal, &enabled))
            .collect();

        for pc in &contexts {
            debug!(
                id = pc.id,
                abstract_syntax = %pc.abstract_syntax,
                transfer_syntax = %pc.transfer_syntax,
                result = ?pc.result,
                "Presentation context negotiated"
            );
        }

        if !contexts.iter().any(NegotiatedContext::is_accepted) {
            warn!(
                "No presentation context accepted for association from '{}'",
                request.calling_ae_title
            );
        }

        let shutdown = contexts
            .iter()
            .any(|pc| pc.is_accepted() && pc.abstract_syntax == uids::PRIVATE_SHUTDOWN);

        if shutdown {
            Ok(NegotiationOutcome::ShutdownRequested(contexts))
        } else {
            Ok(NegotiationOutcome::Accepted(contexts))
        }
    }

    fn negotiate_context(
        &self,
        proposal: &PresentationContextProposal,
        enabled: &[&'static str],
    ) -> NegotiatedContext {
        let abstract_syntax = uids::trim_uid(&proposal.abstract_syntax);
        let proposed: Vec<&str> = proposal
            .transfer_syntaxes
            .iter()
            .map(|ts| uids::trim_uid(ts))
            .collect();

        if Self::is_known_service_syntax(abstract_syntax) {
            if !enabled.iter().any(|uid| *uid == abstract_syntax) {
                return NegotiatedContext::rejected(proposal, ContextResult::AbstractSyntaxNotSupported);
            }
            return Self::accept_first_preferred(proposal, abstract_syntax, &proposed);
        }

        if uids::is_storage_sop_class(abstract_syntax) {
            return self.accept_storage(proposal, abstract_syntax, &proposed);
        }

        if self.accept_unknown_syntaxes {
            Self::accept_first_preferred(proposal, abstract_syntax, &proposed)
        } else {
            NegotiatedContext::rejected(proposal, ContextResult::AbstractSyntaxNotSupported)
        }
    }

    /// Accept with the first uncompressed transfer syntax (in our preference order) the peer offered
    fn accept_first_preferred(
        proposal: &PresentationContextProposal,
        abstract_syntax: &str,
        proposed: &[&str],
    ) -> NegotiatedContext {
        match uids::UNCOMPRESSED_TRANSFER_SYNTAXES
            .iter()
            .find(|ts| proposed.contains(ts))
        {
            Some(ts) => NegotiatedContext::accepted(proposal.id, abstract_syntax, *ts, LocalRole::Scp),
            None => NegotiatedContext::rejected(proposal, ContextResult::TransferSyntaxesNotSupported),
        }
    }

    /// Storage contexts scan from least to most preferred so the most preferred match wins
    fn accept_storage(
        &self,
        proposal: &PresentationContextProposal,
        abstract_syntax: &str,
        proposed: &[&str],
    ) -> NegotiatedContext {
        let mut selected = None;
        for ts in uids::STORAGE_TRANSFER_SYNTAXES.iter().rev() {
            if proposed.contains(ts) {
                selected = Some(*ts);
            }
        }

        let role = if self.enable_get {
            LocalRole::from_proposal(proposal.role)
        } else {
            LocalRole::Scp
        };

        match selected {
            Some(ts) => NegotiatedContext::accepted(proposal.id, abstract_syntax, ts, role),
            None => NegotiatedContext::rejected(proposal, ContextResult::TransferSyntaxesNotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::RoleProposal;

    fn request(contexts: Vec<PresentationContextProposal>) -> AssociationRequest {
        AssociationRequest {
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            implementation_class_uid: "1.2.3.4.5".to_string(),
            implementation_version_name: None,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "DIMSE_NODE".to_string(),
            max_pdu_length: 16384,
            presentation_contexts: contexts,
        }
    }

    fn proposal(id: u8, abstract_syntax: &str, ts: &[&str]) -> PresentationContextProposal {
        PresentationContextProposal {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: ts.iter().map(|s| s.to_string()).collect(),
            role: None,
        }
    }

    fn all_flag_combinations() -> Vec<DimseConfig> {
        (0u8..32)
            .map(|bits| DimseConfig {
                enable_get: bits & 1 != 0,
                enable_patient_root: bits & 2 != 0,
                enable_study_root: bits & 4 != 0,
                enable_patient_study_only: bits & 8 != 0,
                allow_shutdown: bits & 16 != 0,
                ..Default::default()
            })
            .collect()
    }

    const ALL_SYNTAXES: [&str; 3] = [
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
        uids::EXPLICIT_VR_BIG_ENDIAN,
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
    ];

    #[test]
    fn test_bad_application_context_rejected() {
        let negotiator = AssociationNegotiator::new(&DimseConfig::default());
        let mut req = request(vec![proposal(1, uids::VERIFICATION, &ALL_SYNTAXES)]);
        req.application_context_name = "1.2.3".to_string();

        assert_eq!(negotiator.negotiate(&req), Err(RejectReason::BadApplicationContext));
        assert_eq!(
            RejectReason::BadApplicationContext.acse_codes(),
            AcseRejection { result: 1, source: 1, reason: 2 }
        );
    }

    #[test]
    fn test_missing_implementation_uid_never_accepted() {
        for config in all_flag_combinations() {
            let negotiator = AssociationNegotiator::new(&config);
            for uid in ["", "\0", " "] {
                let mut req = request(vec![
                    proposal(1, uids::VERIFICATION, &ALL_SYNTAXES),
                    proposal(3, uids::PRIVATE_SHUTDOWN, &ALL_SYNTAXES),
                ]);
                req.implementation_class_uid = uid.to_string();
                assert_eq!(negotiator.negotiate(&req), Err(RejectReason::MissingImplementationUid));
            }
        }
    }

    #[test]
    fn test_get_syntaxes_never_accepted_without_get() {
        let contexts: Vec<_> = [
            uids::PATIENT_ROOT_GET,
            uids::STUDY_ROOT_GET,
            uids::PATIENT_STUDY_ONLY_GET,
            uids::STUDY_ROOT_FIND,
        ]
        .iter()
        .enumerate()
        .map(|(i, uid)| proposal((i * 2 + 1) as u8, uid, &ALL_SYNTAXES))
        .collect();

        for config in all_flag_combinations().into_iter().filter(|c| !c.enable_get) {
            let negotiator = AssociationNegotiator::new(&config);
            let outcome = negotiator.negotiate(&request(contexts.clone())).expect("accepted");
            assert!(outcome
                .contexts()
                .iter()
                .filter(|pc| pc.is_accepted())
                .all(|pc| !uids::is_get_sop_class(&pc.abstract_syntax)));
            assert!(negotiator
                .enabled_service_syntaxes()
                .iter()
                .all(|uid| !uids::is_get_sop_class(uid)));
        }
    }

    #[test]
    fn test_service_transfer_syntax_preference() {
        let negotiator = AssociationNegotiator::new(&DimseConfig::default());
        let outcome = negotiator
            .negotiate(&request(vec![
                proposal(1, uids::VERIFICATION, &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposal(3, uids::STUDY_ROOT_FIND, &ALL_SYNTAXES),
                proposal(5, uids::STUDY_ROOT_MOVE, &[uids::JPEG_BASELINE]),
            ]))
            .unwrap();

        let contexts = outcome.contexts();
        assert_eq!(contexts[0].transfer_syntax, uids::IMPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(contexts[1].transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(contexts[2].result, ContextResult::TransferSyntaxesNotSupported);
    }

    #[test]
    fn test_disabled_information_model_rejected() {
        let config = DimseConfig {
            enable_patient_root: false,
            ..Default::default()
        };
        let negotiator = AssociationNegotiator::new(&config);
        let outcome = negotiator
            .negotiate(&request(vec![proposal(1, uids::PATIENT_ROOT_FIND, &ALL_SYNTAXES)]))
            .unwrap();
        assert_eq!(outcome.contexts()[0].result, ContextResult::AbstractSyntaxNotSupported);
    }

    #[test]
    fn test_storage_most_preferred_wins_and_role() {
        let ct = "1.2.840.10008.5.1.4.1.1.2";
        let mut storage = proposal(
            1,
            ct,
            &[uids::JPEG_2000, uids::IMPLICIT_VR_LITTLE_ENDIAN, uids::EXPLICIT_VR_LITTLE_ENDIAN],
        );
        storage.role = Some(RoleProposal { scu: false, scp: true });

        let without_get = AssociationNegotiator::new(&DimseConfig::default());
        let outcome = without_get.negotiate(&request(vec![storage.clone()])).unwrap();
        assert_eq!(outcome.contexts()[0].transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(outcome.contexts()[0].role, LocalRole::Scp);

        let with_get = AssociationNegotiator::new(&DimseConfig {
            enable_get: true,
            ..Default::default()
        });
        let outcome = with_get.negotiate(&request(vec![storage])).unwrap();
        assert_eq!(outcome.contexts()[0].role, LocalRole::Scu);
    }

    #[test]
    fn test_storage_outside_image_root_negotiated_as_storage() {
        let strict = AssociationNegotiator::new(&DimseConfig {
            accept_unknown_syntaxes: false,
            ..Default::default()
        });
        let beams_instruction = proposal(1, "1.2.840.10008.5.1.4.34.7", &[uids::JPEG_2000_LOSSLESS]);
        let hanging_protocol = proposal(3, "1.2.840.10008.5.1.4.38.1", &ALL_SYNTAXES);
        let outcome = strict
            .negotiate(&request(vec![beams_instruction, hanging_protocol]))
            .unwrap();

        let contexts = outcome.contexts();
        assert!(contexts[0].is_accepted());
        assert_eq!(contexts[0].transfer_syntax, uids::JPEG_2000_LOSSLESS);
        assert_eq!(contexts[0].role, LocalRole::Scp);
        assert_eq!(contexts[1].transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
    }

    #[test]
    fn test_unknown_syntax_policy() {
        let unknown = proposal(1, "1.2.840.10008.5.1.4.31", &ALL_SYNTAXES);

        let permissive = AssociationNegotiator::new(&DimseConfig::default());
        let outcome = permissive.negotiate(&request(vec![unknown.clone()])).unwrap();
        assert!(outcome.contexts()[0].is_accepted());

        let strict = AssociationNegotiator::new(&DimseConfig {
            accept_unknown_syntaxes: false,
            ..Default::default()
        });
        let outcome = strict.negotiate(&request(vec![unknown])).unwrap();
        assert_eq!(outcome.contexts()[0].result, ContextResult::AbstractSyntaxNotSupported);
    }

    #[test]
    fn test_shutdown_only_when_allowed() {
        let contexts = vec![proposal(1, uids::PRIVATE_SHUTDOWN, &ALL_SYNTAXES)];

        let denied = AssociationNegotiator::new(&DimseConfig::default());
        assert!(matches!(
            denied.negotiate(&request(contexts.clone())),
            Ok(NegotiationOutcome::Accepted(_))
        ));

        let allowed = AssociationNegotiator::new(&DimseConfig {
            allow_shutdown: true,
            ..Default::default()
        });
        assert!(matches!(
            allowed.negotiate(&request(contexts)),
            Ok(NegotiationOutcome::ShutdownRequested(_))
        ));
    }

    #[test]
    fn test_called_ae_check() {
        let negotiator = AssociationNegotiator::new(&DimseConfig {
            check_called_ae_title: true,
            ..Default::default()
        });
        let mut req = request(vec![proposal(1, uids::VERIFICATION, &ALL_SYNTAXES)]);
        req.called_ae_title = "SOMEONE_ELSE".to_string();
        assert_eq!(negotiator.negotiate(&req), Err(RejectReason::CalledAeTitleNotRecognized));
    }

    #[test]
    fn test_context_ids_preserved() {
        let negotiator = AssociationNegotiator::new(&DimseConfig::default());
        let outcome = negotiator
            .negotiate(&request(vec![
                proposal(7, uids::VERIFICATION, &ALL_SYNTAXES),
                proposal(9, uids::STUDY_ROOT_FIND, &ALL_SYNTAXES),
            ]))
            .unwrap();
        let ids: Vec<u8> = outcome.contexts().iter().map(|pc| pc.id).collect();
        assert_eq!(ids, vec![7, 9]);
    }
}
