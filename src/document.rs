//! Approval documents, the submission draft and their shared value types
use super::chain::{ChainEntry, EntryStatus, Referrer};
use super::error::{EngineError, StoreError, ValidationError};
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// Compared as instants. Derived impls would demand the zone type itself be
// ordered, which `Utc` is not.
impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// None when the fields do not name a valid instant.
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self::from)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Form family of a document. Unknown tags are kept as-is.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum DocumentType {
    #[n(0)]
    InternalApproval,
    #[n(1)]
    Resignation,
    #[n(2)]
    WorkReport,
    #[n(3)]
    GenericForm,
    #[n(4)]
    Other(#[n(0)] String),
}

impl DocumentType {
    pub fn as_str(&self) -> &str {
        match self {
            DocumentType::InternalApproval => "internal_approval",
            DocumentType::Resignation => "resignation",
            DocumentType::WorkReport => "work_report",
            DocumentType::GenericForm => "generic_form",
            DocumentType::Other(tag) => tag,
        }
    }
}

impl From<&str> for DocumentType {
    fn from(tag: &str) -> Self {
        match tag {
            "internal_approval" => DocumentType::InternalApproval,
            "resignation" => DocumentType::Resignation,
            "work_report" => DocumentType::WorkReport,
            "generic_form" => DocumentType::GenericForm,
            other => DocumentType::Other(other.to_string()),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Approved => "approved",
            DocumentStatus::Rejected => "rejected",
        }
    }
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::Pending)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a file held in the object store.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    #[n(0)]
    pub path: String,
    #[n(1)]
    pub original_name: String,
    #[n(2)]
    pub size: u64,
}

impl Attachment {
    pub fn new(path: &str, original_name: &str, size: u64) -> Self {
        Self {
            path: path.to_string(),
            original_name: original_name.to_string(),
            size,
        }
    }
}

/// A user as they appeared when the document was submitted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub position: String,
}

impl Participant {
    /// `user_id` is stored trimmed.
    pub fn new(user_id: &str, name: &str, position: &str) -> Self {
        Self {
            user_id: user_id.trim().to_string(),
            name: name.to_string(),
            position: position.to_string(),
        }
    }
}

// Also used as the hashed snapshot of what approvers sign
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct ApprovalDraft {
    #[n(0)]
    title: String,
    #[n(1)]
    document_type: Option<DocumentType>,
    #[n(2)]
    content: BTreeMap<String, String>,
    #[n(3)]
    approvers: Vec<Participant>,
    #[n(4)]
    referrers: Vec<Participant>,
    #[n(5)]
    attachments: Vec<Attachment>,
}

impl ApprovalDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
    pub fn set_document_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = Some(document_type);
        self
    }
    pub fn set_content(mut self, content: BTreeMap<String, String>) -> Self {
        self.content = content;
        self
    }
    pub fn add_field(mut self, key: &str, value: &str) -> Self {
        self.content.insert(key.to_string(), value.to_string());
        self
    }
    pub fn add_approver(mut self, approver: Participant) -> Self {
        self.approvers.push(trimmed(approver));
        self
    }
    pub fn add_referrer(mut self, referrer: Participant) -> Self {
        self.referrers.push(trimmed(referrer));
        self
    }
    pub fn add_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
    pub fn approvers(&self) -> &[Participant] {
        &self.approvers
    }

    /// Referrers with repeated user ids collapsed, first occurrence kept.
    pub fn distinct_referrers(&self) -> Vec<Participant> {
        let mut seen = HashSet::new();
        self.referrers
            .iter()
            .filter(|r| seen.insert(r.user_id.as_str()))
            .cloned()
            .collect()
    }

    // Checks fields, then returns the sha256 of the draft serialised into cbor
    pub fn validate_and_finalise(&self, max_approvers: usize) -> Result<String, EngineError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle.into());
        }
        if self.document_type.is_none() {
            return Err(ValidationError::MissingDocumentType.into());
        }
        if self.approvers.is_empty() {
            return Err(ValidationError::NoApprovers.into());
        }
        if self.approvers.len() > max_approvers {
            return Err(ValidationError::TooManyApprovers {
                len: self.approvers.len(),
                max: max_approvers,
            }
            .into());
        }

        let mut seen = HashSet::new();
        for (idx, approver) in self.approvers.iter().enumerate() {
            if approver.user_id.is_empty() {
                return Err(ValidationError::EmptyApproverId(idx + 1).into());
            }
            check_user_id(&approver.user_id)?;
            if !seen.insert(approver.user_id.as_str()) {
                return Err(ValidationError::DuplicateApprover(approver.user_id.clone()).into());
            }
        }
        for (idx, referrer) in self.referrers.iter().enumerate() {
            if referrer.user_id.is_empty() {
                return Err(ValidationError::EmptyReferrerId(idx + 1).into());
            }
            check_user_id(&referrer.user_id)?;
        }

        let contents = minicbor::to_vec(self).map_err(StoreError::from)?;
        Ok(sha256::digest(&contents))
    }
}

fn trimmed(mut participant: Participant) -> Participant {
    participant.user_id = participant.user_id.trim().to_string();
    participant
}

// ids become storage key prefixes, which are NUL terminated
fn check_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.contains('\0') {
        return Err(ValidationError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDocument {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub content: BTreeMap<String, String>,
    #[n(3)]
    pub content_hash: String,
    #[n(4)]
    pub document_type: DocumentType,
    #[n(5)]
    pub author_id: String,
    #[n(6)]
    pub current_step: u32,
    #[n(7)]
    pub current_approver_id: Option<String>,
    #[n(8)]
    pub status: DocumentStatus,
    #[n(9)]
    pub attachments: Vec<Attachment>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
}

impl ApprovalDocument {
    /// Materialise a validated draft into a pending document and its chain.
    /// The first approver is left waiting, everyone after is not yet reached.
    pub fn from_draft(
        id: String,
        author_id: &str,
        draft: &ApprovalDraft,
        content_hash: String,
        now: TimeStamp<Utc>,
    ) -> Result<(Self, Vec<ChainEntry>, Vec<Referrer>), EngineError> {
        let document_type = draft
            .document_type
            .clone()
            .ok_or(ValidationError::MissingDocumentType)?;
        let first = draft.approvers.first().ok_or(ValidationError::NoApprovers)?;

        let chain = draft
            .approvers
            .iter()
            .enumerate()
            .map(|(idx, approver)| {
                let status = if idx == 0 {
                    EntryStatus::Waiting
                } else {
                    EntryStatus::NotReached
                };
                ChainEntry::new(id.clone(), approver.clone(), idx as u32 + 1, status)
            })
            .collect();

        let referrers = draft
            .distinct_referrers()
            .into_iter()
            .map(|participant| Referrer::new(id.clone(), participant))
            .collect();

        let document = Self {
            current_approver_id: Some(first.user_id.clone()),
            id,
            title: draft.title.trim().to_string(),
            content: draft.content.clone(),
            content_hash,
            document_type,
            author_id: author_id.to_string(),
            current_step: 1,
            status: DocumentStatus::Pending,
            attachments: draft.attachments.clone(),
            created_at: now.clone(),
            updated_at: now,
        };

        Ok((document, chain, referrers))
    }

    pub fn is_pending(&self) -> bool {
        self.status == DocumentStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ApprovalDraft {
        ApprovalDraft::new()
            .set_title("Laptop purchase")
            .set_document_type(DocumentType::InternalApproval)
            .add_field("amount", "1,200,000")
            .add_approver(Participant::new("user_a", "Kim", "Team Lead"))
            .add_approver(Participant::new("user_b", "Lee", "Director"))
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn unknown_document_type_is_kept() {
        let tag = DocumentType::from("vacation_request");

        assert_eq!(tag, DocumentType::Other("vacation_request".into()));
        assert_eq!(tag.as_str(), "vacation_request");
        assert_eq!(DocumentType::from("resignation"), DocumentType::Resignation);
    }

    #[test]
    fn from_draft_activates_first_approver() {
        let draft = draft();
        let hash = draft.validate_and_finalise(10).unwrap();
        let (doc, chain, _) =
            ApprovalDocument::from_draft("doc_1".into(), "user_x", &draft, hash, TimeStamp::new())
                .unwrap();

        assert_eq!(doc.current_step, 1);
        assert_eq!(doc.current_approver_id.as_deref(), Some("user_a"));
        assert_eq!(chain[0].status, EntryStatus::Waiting);
        assert_eq!(chain[1].status, EntryStatus::NotReached);
        assert_eq!(chain[1].sequence, 2);
    }

    #[test]
    fn timestamps_order_by_instant() {
        let earlier = TimeStamp::new_with(2024, 1, 1, 9, 0, 0).unwrap();
        let later = TimeStamp::new_with(2024, 1, 1, 9, 0, 1).unwrap();

        assert!(earlier < later);
        assert_eq!(later.cmp(&earlier), Ordering::Greater);
        let mut stamps = vec![later.clone(), earlier.clone()];
        stamps.sort();
        assert_eq!(stamps, vec![earlier, later]);
    }

    #[test]
    fn participant_ids_are_trimmed() {
        let draft = draft()
            .add_approver(Participant {
                user_id: " user_c ".into(),
                name: "Park".into(),
                position: "CEO".into(),
            })
            .add_referrer(Participant::new("  user_d", "Choi", "HR"));
        let hash = draft.validate_and_finalise(10).unwrap();
        let (_, chain, referrers) =
            ApprovalDocument::from_draft("doc_1".into(), "user_x", &draft, hash, TimeStamp::new())
                .unwrap();

        assert_eq!(chain[2].approver_id(), "user_c");
        assert_eq!(referrers[0].referrer.user_id, "user_d");
    }

    #[test]
    fn padded_duplicate_approver_is_caught() {
        let err = draft()
            .add_approver(Participant::new(" user_a", "Kim", "Team Lead"))
            .validate_and_finalise(10)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DuplicateApprover(id)) if id == "user_a"
        ));
    }

    #[test]
    fn empty_referrer_is_rejected() {
        let err = draft()
            .add_referrer(Participant::new("user_d", "Choi", "HR"))
            .add_referrer(Participant::new("   ", "", ""))
            .validate_and_finalise(10)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EmptyReferrerId(2))
        ));
    }

    #[test]
    fn nul_in_user_id_is_rejected() {
        let err = draft()
            .add_approver(Participant::new("user\0c", "", ""))
            .validate_and_finalise(10)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::InvalidUserId(_))
        ));
    }

    #[test]
    fn blank_title_is_rejected() {
        let err = draft().set_title("   ").validate_and_finalise(10).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EmptyTitle)
        ));
    }
}
