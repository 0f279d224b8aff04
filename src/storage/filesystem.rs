use crate::storage::{StorageError, StorageResult};
use async_trait::async_trait;
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom_core::Tag;
use dimse::command::can_write;
use dimse::{uids, RetrieveSink, RetrievedDataset, SinkError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Part-10 archive laid out as `<root>/<StudyUID>/<SeriesUID>/<SOPInstanceUID>.dcm`
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend with the given root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Keep the path as given; canonicalizing resolves symlinks such as
        // /var -> /private/var and breaks comparisons against the caller's path.
        Ok(Self { root_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }

    /// Where an instance is (or would be) stored
    pub fn path_for(&self, study_uid: &str, series_uid: &str, sop_instance_uid: &str) -> PathBuf {
        self.root_path
            .join(path_component(study_uid))
            .join(path_component(series_uid))
            .join(format!("{}.dcm", path_component(sop_instance_uid)))
    }

    /// Write one data set as a Part-10 file; blocking.
    ///
    /// The requested transfer syntax is kept when it can be written, otherwise
    /// the file is written in Explicit VR Little Endian.
    pub fn write_dataset(&self, retrieved: RetrievedDataset) -> StorageResult<PathBuf> {
        let RetrievedDataset {
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax,
            dataset,
        } = retrieved;

        let sop_instance_uid = non_empty(sop_instance_uid)
            .or_else(|| read_uid(&dataset, tags::SOP_INSTANCE_UID))
            .ok_or_else(|| StorageError::Path("data set has no SOP Instance UID".to_string()))?;
        let sop_class_uid = non_empty(sop_class_uid)
            .or_else(|| read_uid(&dataset, tags::SOP_CLASS_UID))
            .ok_or_else(|| StorageError::Path("data set has no SOP Class UID".to_string()))?;
        let study_uid = read_uid(&dataset, tags::STUDY_INSTANCE_UID).unwrap_or_default();
        let series_uid = read_uid(&dataset, tags::SERIES_INSTANCE_UID).unwrap_or_default();

        let transfer_syntax = if can_write(&transfer_syntax) {
            transfer_syntax
        } else {
            debug!(
                "Transfer syntax {} cannot be written, storing {} as Explicit VR Little Endian",
                transfer_syntax, sop_instance_uid
            );
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string()
        };

        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(transfer_syntax.as_str())
            .media_storage_sop_class_uid(sop_class_uid.as_str())
            .media_storage_sop_instance_uid(sop_instance_uid.as_str())
            .implementation_class_uid(uids::IMPLEMENTATION_CLASS_UID)
            .implementation_version_name(uids::IMPLEMENTATION_VERSION_NAME)
            .build()
            .map_err(|e| StorageError::Dicom(format!("Failed to build file meta: {}", e)))?;

        let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
        for elem in dataset {
            file_obj.put(elem);
        }

        let path = self.path_for(&study_uid, &series_uid, &sop_instance_uid);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            debug!("Replacing existing instance {}", path.display());
        }

        // Written under a temporary name so readers never see a partial file
        let partial = path.with_extension("dcm.part");
        let written = file_obj
            .write_to_file(&partial)
            .map_err(|e| StorageError::Dicom(format!("Failed to write {}: {}", partial.display(), e)))
            .and_then(|_| std::fs::rename(&partial, &path).map_err(StorageError::from));
        if let Err(e) = written {
            discard_partial(&partial);
            return Err(e);
        }

        Ok(path)
    }
}

fn discard_partial(partial: &Path) {
    match std::fs::remove_file(partial) {
        Ok(()) => debug!("Removed partial file {}", partial.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", partial.display(), e),
    }
}

#[async_trait]
impl RetrieveSink for FilesystemStorage {
    async fn store(&self, dataset: RetrievedDataset) -> Result<(), SinkError> {
        let storage = self.clone();
        let path = tokio::task::spawn_blocking(move || storage.write_dataset(dataset))
            .await
            .map_err(|e| SinkError::Failed(format!("storage task failed: {}", e)))??;
        info!("Stored {}", path.display());
        Ok(())
    }
}

impl From<StorageError> for SinkError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => SinkError::Io(e),
            StorageError::Path(e) => SinkError::DatasetMismatch(e),
            StorageError::Config(e) | StorageError::Dicom(e) => SinkError::Failed(e),
        }
    }
}

fn non_empty(uid: String) -> Option<String> {
    let trimmed = uids::trim_uid(&uid);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_uid(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .and_then(|s| non_empty(s.into_owned()))
}

/// UIDs are digits and dots; anything else is replaced so a value cannot escape the root
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        cleaned
    }
}
