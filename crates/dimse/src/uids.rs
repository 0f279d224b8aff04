//! Well-known DICOM UIDs used during negotiation and messaging

use dicom_dictionary_std::uids as std_uids;

/// DICOM Application Context Name (PS3.7 Annex A.2.1)
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implementation identity announced in every association
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.9.7433.1.1";
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE_NODE_020";

pub const VERIFICATION: &str = "1.2.840.10008.1.1";

pub const PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
pub const PATIENT_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
pub const PATIENT_ROOT_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";

pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
pub const STUDY_ROOT_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";

pub const PATIENT_STUDY_ONLY_FIND: &str = "1.2.840.10008.5.1.4.1.2.3.1";
pub const PATIENT_STUDY_ONLY_MOVE: &str = "1.2.840.10008.5.1.4.1.2.3.2";
pub const PATIENT_STUDY_ONLY_GET: &str = "1.2.840.10008.5.1.4.1.2.3.3";

/// Private SOP class a peer proposes to ask the server to shut down
pub const PRIVATE_SHUTDOWN: &str = "1.2.276.0.7230010.3.4.1915765545.18030.917282194.0";

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";

/// Transfer syntaxes offered and accepted for non-storage services, most preferred first
pub const UNCOMPRESSED_TRANSFER_SYNTAXES: [&str; 3] = [
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
    IMPLICIT_VR_LITTLE_ENDIAN,
];

/// Transfer syntaxes accepted for storage, most preferred first
pub const STORAGE_TRANSFER_SYNTAXES: [&str; 11] = [
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
    IMPLICIT_VR_LITTLE_ENDIAN,
    DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
    JPEG_LOSSLESS_SV1,
    JPEG_BASELINE,
    JPEG_EXTENDED,
    JPEG_LS_LOSSLESS,
    JPEG_2000_LOSSLESS,
    JPEG_2000,
    RLE_LOSSLESS,
];

/// Most storage SOP classes sit under this root
const STORAGE_SOP_CLASS_ROOT: &str = "1.2.840.10008.5.1.4.1.1.";

/// Storage SOP classes registered outside `STORAGE_SOP_CLASS_ROOT`
const STORAGE_SOP_CLASSES_OUTSIDE_ROOT: [&str; 10] = [
    std_uids::STORED_PRINT_STORAGE,
    std_uids::HARDCOPY_GRAYSCALE_IMAGE_STORAGE,
    std_uids::HARDCOPY_COLOR_IMAGE_STORAGE,
    std_uids::RT_BEAMS_DELIVERY_INSTRUCTION_STORAGE,
    std_uids::RT_BRACHY_APPLICATION_SETUP_DELIVERY_INSTRUCTION_STORAGE,
    std_uids::HANGING_PROTOCOL_STORAGE,
    std_uids::COLOR_PALETTE_STORAGE,
    std_uids::GENERIC_IMPLANT_TEMPLATE_STORAGE,
    std_uids::IMPLANT_ASSEMBLY_TEMPLATE_STORAGE,
    std_uids::IMPLANT_TEMPLATE_GROUP_STORAGE,
];

/// Storage SOP classes proposed by the move destination side
pub const STORAGE_SOP_CLASSES: [&str; 40] = [
    "1.2.840.10008.5.1.4.1.1.1",       // Computed Radiography
    "1.2.840.10008.5.1.4.1.1.1.1",     // Digital X-Ray For Presentation
    "1.2.840.10008.5.1.4.1.1.1.1.1",   // Digital X-Ray For Processing
    "1.2.840.10008.5.1.4.1.1.1.2",     // Digital Mammography For Presentation
    "1.2.840.10008.5.1.4.1.1.1.2.1",   // Digital Mammography For Processing
    "1.2.840.10008.5.1.4.1.1.1.3",     // Digital Intra-Oral X-Ray For Presentation
    "1.2.840.10008.5.1.4.1.1.2",       // CT
    "1.2.840.10008.5.1.4.1.1.2.1",     // Enhanced CT
    "1.2.840.10008.5.1.4.1.1.3.1",     // Ultrasound Multi-frame
    "1.2.840.10008.5.1.4.1.1.4",       // MR
    "1.2.840.10008.5.1.4.1.1.4.1",     // Enhanced MR
    "1.2.840.10008.5.1.4.1.1.4.2",     // MR Spectroscopy
    "1.2.840.10008.5.1.4.1.1.6.1",     // Ultrasound
    "1.2.840.10008.5.1.4.1.1.7",       // Secondary Capture
    "1.2.840.10008.5.1.4.1.1.7.2",     // Multi-frame Grayscale Byte SC
    "1.2.840.10008.5.1.4.1.1.7.3",     // Multi-frame Grayscale Word SC
    "1.2.840.10008.5.1.4.1.1.7.4",     // Multi-frame True Color SC
    "1.2.840.10008.5.1.4.1.1.9.1.1",   // 12-lead ECG
    "1.2.840.10008.5.1.4.1.1.11.1",    // Grayscale Softcopy Presentation State
    "1.2.840.10008.5.1.4.1.1.12.1",    // X-Ray Angiographic
    "1.2.840.10008.5.1.4.1.1.12.1.1",  // Enhanced XA
    "1.2.840.10008.5.1.4.1.1.12.2",    // X-Ray Radiofluoroscopic
    "1.2.840.10008.5.1.4.1.1.13.1.3",  // Breast Tomosynthesis
    "1.2.840.10008.5.1.4.1.1.20",      // Nuclear Medicine
    "1.2.840.10008.5.1.4.1.1.66",      // Raw Data
    "1.2.840.10008.5.1.4.1.1.66.1",    // Spatial Registration
    "1.2.840.10008.5.1.4.1.1.66.4",    // Segmentation
    "1.2.840.10008.5.1.4.1.1.77.1.1",  // VL Endoscopic
    "1.2.840.10008.5.1.4.1.1.77.1.4",  // VL Photographic
    "1.2.840.10008.5.1.4.1.1.88.11",   // Basic Text SR
    "1.2.840.10008.5.1.4.1.1.88.22",   // Enhanced SR
    "1.2.840.10008.5.1.4.1.1.88.33",   // Comprehensive SR
    "1.2.840.10008.5.1.4.1.1.88.59",   // Key Object Selection
    "1.2.840.10008.5.1.4.1.1.104.1",   // Encapsulated PDF
    "1.2.840.10008.5.1.4.1.1.128",     // PET
    "1.2.840.10008.5.1.4.1.1.130",     // Enhanced PET
    "1.2.840.10008.5.1.4.1.1.481.1",   // RT Image
    "1.2.840.10008.5.1.4.1.1.481.2",   // RT Dose
    "1.2.840.10008.5.1.4.1.1.481.3",   // RT Structure Set
    "1.2.840.10008.5.1.4.1.1.481.5",   // RT Plan
];

pub fn is_storage_sop_class(uid: &str) -> bool {
    uid.starts_with(STORAGE_SOP_CLASS_ROOT) || STORAGE_SOP_CLASSES_OUTSIDE_ROOT.contains(&uid)
}

pub fn is_get_sop_class(uid: &str) -> bool {
    matches!(
        uid,
        PATIENT_ROOT_GET | STUDY_ROOT_GET | PATIENT_STUDY_ONLY_GET
    )
}

/// UIDs in PDUs and datasets may carry a trailing NUL or space pad
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(['\0', ' '])
}
