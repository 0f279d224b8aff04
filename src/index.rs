//! C-FIND provider over the Part-10 archive
//!
//! Every query walks the storage directory lazily: one file is opened per
//! candidate examined, so a cancelled query stops touching the disk at once.
//! Matching follows the usual attribute-matching rules: empty values are
//! return keys, `*` and `?` are wildcards, UID lists match any member and DA
//! values may be ranges.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use dimse::{uids, MatchProvider, MatchQuery, ProviderError, QueryLevel};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Information models the index answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InformationModel {
    PatientRoot,
    StudyRoot,
    PatientStudyOnly,
}

impl InformationModel {
    fn from_uid(uid: &str) -> Option<Self> {
        match uids::trim_uid(uid) {
            uids::PATIENT_ROOT_FIND => Some(Self::PatientRoot),
            uids::STUDY_ROOT_FIND => Some(Self::StudyRoot),
            uids::PATIENT_STUDY_ONLY_FIND => Some(Self::PatientStudyOnly),
            _ => None,
        }
    }

    fn allows(&self, level: QueryLevel) -> bool {
        match self {
            Self::PatientRoot => true,
            Self::StudyRoot => level != QueryLevel::Patient,
            Self::PatientStudyOnly => matches!(level, QueryLevel::Patient | QueryLevel::Study),
        }
    }
}

/// Key that identifies one entity at a level
fn unique_key(level: QueryLevel) -> (Tag, VR) {
    match level {
        QueryLevel::Patient => (tags::PATIENT_ID, VR::LO),
        QueryLevel::Study => (tags::STUDY_INSTANCE_UID, VR::UI),
        QueryLevel::Series => (tags::SERIES_INSTANCE_UID, VR::UI),
        QueryLevel::Image => (tags::SOP_INSTANCE_UID, VR::UI),
    }
}

#[derive(Debug, Clone)]
struct MatchKey {
    tag: Tag,
    vr: VR,
    value: String,
}

impl MatchKey {
    fn matches(&self, candidate: Option<&str>) -> bool {
        let pattern = self.value.trim_matches(|c: char| c == ' ' || c == '\0');
        if pattern.is_empty() || pattern == "*" {
            return true;
        }
        let Some(candidate) = candidate else {
            return false;
        };

        candidate
            .split('\\')
            .map(|value| value.trim_matches(|c: char| c == ' ' || c == '\0'))
            .any(|value| self.matches_value(pattern, value))
    }

    fn matches_value(&self, pattern: &str, value: &str) -> bool {
        if self.vr == VR::UI && pattern.contains('\\') {
            return pattern.split('\\').any(|uid| uid.trim() == value);
        }
        if self.vr == VR::DA {
            if let Some((from, to)) = pattern.split_once('-') {
                return (from.is_empty() || value >= from) && (to.is_empty() || value <= to);
            }
        }
        if pattern.contains(['*', '?']) {
            return wildcard_match(pattern, value);
        }
        pattern == value
    }
}

/// Parsed C-FIND identifier
#[derive(Debug, Clone)]
struct QueryRequest {
    level: QueryLevel,
    keys: Vec<MatchKey>,
}

impl QueryRequest {
    fn from_identifier(identifier: &InMemDicomObject) -> Result<Self, ProviderError> {
        let level: QueryLevel = identifier
            .element(tags::QUERY_RETRIEVE_LEVEL)
            .ok()
            .and_then(|e| e.to_str().ok())
            .ok_or_else(|| ProviderError::InvalidIdentifier("missing Query/Retrieve Level".to_string()))?
            .parse()
            .map_err(|e: dimse::DimseError| ProviderError::InvalidIdentifier(e.to_string()))?;

        let mut keys = Vec::new();
        for elem in identifier.iter() {
            let tag = elem.header().tag;
            if tag == tags::QUERY_RETRIEVE_LEVEL
                || tag == tags::SPECIFIC_CHARACTER_SET
                || tag == tags::RETRIEVE_AE_TITLE
                || tag.element() == 0x0000
            {
                continue;
            }
            match elem.to_str() {
                Ok(value) => keys.push(MatchKey {
                    tag,
                    vr: elem.vr(),
                    value: value.into_owned(),
                }),
                Err(_) => debug!("Ignoring non-textual key {}", tag),
            }
        }

        let (tag, vr) = unique_key(level);
        if !keys.iter().any(|k| k.tag == tag) {
            keys.push(MatchKey {
                tag,
                vr,
                value: String::new(),
            });
        }

        Ok(Self { level, keys })
    }

    fn matches(&self, file: &DefaultDicomObject) -> bool {
        self.keys.iter().all(|key| {
            let value = file.element(key.tag).ok().and_then(|e| e.to_str().ok());
            key.matches(value.as_deref())
        })
    }

    fn response(&self, file: &DefaultDicomObject) -> InMemDicomObject {
        let mut response = InMemDicomObject::new_empty();
        response.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.level.to_string()),
        ));
        if let Ok(charset) = file.element(tags::SPECIFIC_CHARACTER_SET) {
            response.put(charset.clone());
        }
        for key in &self.keys {
            match file.element(key.tag) {
                Ok(elem) => response.put(elem.clone()),
                Err(_) => response.put(DataElement::empty(key.tag, key.vr)),
            };
        }
        response
    }
}

/// Answers C-FIND queries from the files under a directory
#[derive(Debug, Clone)]
pub struct FolderIndex {
    root: PathBuf,
}

impl FolderIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl MatchProvider for FolderIndex {
    async fn start_query(
        &self,
        abstract_syntax: &str,
        identifier: &InMemDicomObject,
    ) -> Result<Box<dyn MatchQuery>, ProviderError> {
        let model = InformationModel::from_uid(abstract_syntax)
            .ok_or_else(|| ProviderError::UnsupportedModel(abstract_syntax.to_string()))?;
        let request = QueryRequest::from_identifier(identifier)?;
        if !model.allows(request.level) {
            return Err(ProviderError::InvalidIdentifier(format!(
                "level {} is not valid for {:?}",
                request.level, model
            )));
        }

        debug!(
            "Query at {} level with {} keys under {}",
            request.level,
            request.keys.len(),
            self.root.display()
        );
        Ok(Box::new(FolderQuery {
            walk: Some(Walk::new(&self.root, request)),
        }))
    }
}

/// Directory walk state; moved onto the blocking pool for each step
struct Walk {
    entries: walkdir::IntoIter,
    request: QueryRequest,
    seen: HashSet<String>,
}

impl Walk {
    fn new(root: &Path, request: QueryRequest) -> Self {
        Self {
            entries: WalkDir::new(root).sort_by_file_name().into_iter(),
            request,
            seen: HashSet::new(),
        }
    }

    /// Next matching entity not reported yet
    fn advance(&mut self) -> Option<InMemDicomObject> {
        let (unique_tag, _) = unique_key(self.request.level);
        for entry in self.entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable archive entry: {}", e);
                    continue;
                }
            };
            let is_instance = entry.file_type().is_file()
                && entry.path().extension().map_or(false, |ext| ext == "dcm");
            if !is_instance {
                continue;
            }

            let file = match OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(entry.path())
            {
                Ok(file) => file,
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            if !self.request.matches(&file) {
                continue;
            }
            let unique = file
                .element(unique_tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| uids::trim_uid(&s).to_string())
                .unwrap_or_default();
            if !self.seen.insert(unique) {
                continue;
            }
            return Some(self.request.response(&file));
        }
        None
    }
}

struct FolderQuery {
    walk: Option<Walk>,
}

#[async_trait]
impl MatchQuery for FolderQuery {
    async fn next(&mut self) -> Result<Option<InMemDicomObject>, ProviderError> {
        let Some(mut walk) = self.walk.take() else {
            return Ok(None);
        };
        let (walk, found) = tokio::task::spawn_blocking(move || {
            let found = walk.advance();
            (walk, found)
        })
        .await
        .map_err(|e| ProviderError::Failed(format!("index task failed: {}", e)))?;

        if found.is_some() {
            self.walk = Some(walk);
        }
        Ok(found)
    }

    async fn cancel(&mut self) {
        self.walk = None;
    }
}

/// `*` matches any run of characters, `?` exactly one
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
