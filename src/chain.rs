//! Approval chain entries, history records and the step transition
//!
//! Every state change of a document goes through [`Transition::compute`]. It
//! takes the document and its chain, checks the gates, and returns the rows
//! to write back (the waiting entry and the one after it). Stores only
//! persist what it returns.
use super::document::{ApprovalDocument, DocumentStatus, Participant, TimeStamp};
use super::error::EngineError;
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    #[n(0)]
    NotReached,
    #[n(1)]
    Waiting,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
}

impl EntryStatus {
    /// Label shown on the signature box.
    pub fn label(&self) -> &'static str {
        match self {
            EntryStatus::NotReached => "미결",
            EntryStatus::Waiting => "대기",
            EntryStatus::Approved => "승인",
            EntryStatus::Rejected => "반려",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub approver: Participant, // snapshot at submission, never refreshed
    #[n(2)]
    pub sequence: u32,
    #[n(3)]
    pub status: EntryStatus,
    #[n(4)]
    pub decided_at: Option<TimeStamp<Utc>>,
    #[n(5)]
    pub comment: Option<String>,
}

impl ChainEntry {
    pub fn new(
        document_id: String,
        approver: Participant,
        sequence: u32,
        status: EntryStatus,
    ) -> Self {
        Self {
            document_id,
            approver,
            sequence,
            status,
            decided_at: None,
            comment: None,
        }
    }
    pub fn approver_id(&self) -> &str {
        &self.approver.user_id
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Referrer {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub referrer: Participant,
}

impl Referrer {
    pub fn new(document_id: String, referrer: Participant) -> Self {
        Self {
            document_id,
            referrer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum HistoryAction {
    #[n(0)]
    Submit {
        #[n(0)]
        content_hash: String,
        #[n(1)]
        approver_ids: Vec<String>,
    },
    #[n(1)]
    Approve {
        #[n(0)]
        sequence: u32,
    },
    #[n(2)]
    Reject {
        #[n(0)]
        sequence: u32,
    },
}

/// Append-only audit line. Written once, never edited.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct HistoryRecord {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub action: HistoryAction,
    #[n(3)]
    pub comment: Option<String>,
    #[n(4)]
    pub timestamp: TimeStamp<Utc>,
}

impl HistoryRecord {
    pub fn new(
        document_id: String,
        actor_id: String,
        action: HistoryAction,
        comment: Option<String>,
        timestamp: TimeStamp<Utc>,
    ) -> Self {
        Self {
            document_id,
            actor_id,
            action,
            comment,
            timestamp,
        }
    }

    pub fn submitted(document: &ApprovalDocument, chain: &[ChainEntry]) -> Self {
        Self::new(
            document.id.clone(),
            document.author_id.clone(),
            HistoryAction::Submit {
                content_hash: document.content_hash.clone(),
                approver_ids: chain.iter().map(|e| e.approver_id().to_string()).collect(),
            },
            None,
            document.created_at.clone(),
        )
    }
}

/// The rows a single decision rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub document: ApprovalDocument,
    pub decided: ChainEntry,
    pub activated: Option<ChainEntry>,
    pub record: HistoryRecord,
}

/// Whether `actor_id` may decide on `document` now. A terminal document, or
/// an approver whose own entry is already decided, is a conflict. Anyone
/// else who is not the current gate is refused. No admin override.
pub fn check_gate(
    document: &ApprovalDocument,
    actor_id: &str,
    chain: &[ChainEntry],
) -> Result<(), EngineError> {
    if document.status.is_terminal() {
        return Err(EngineError::AlreadyProcessed {
            document_id: document.id.clone(),
            status: document.status,
        });
    }
    if document.current_approver_id.as_deref() == Some(actor_id) {
        return Ok(());
    }

    let already_signed = chain.iter().any(|e| {
        e.approver_id() == actor_id
            && matches!(e.status, EntryStatus::Approved | EntryStatus::Rejected)
    });
    if already_signed {
        Err(EngineError::AlreadyProcessed {
            document_id: document.id.clone(),
            status: document.status,
        })
    } else {
        Err(EngineError::NotAuthorized {
            document_id: document.id.clone(),
            user_id: actor_id.to_string(),
        })
    }
}

impl Transition {
    /// `chain` is the document's full chain ordered by sequence.
    pub fn compute(
        document: &ApprovalDocument,
        actor_id: &str,
        chain: &[ChainEntry],
        decision: Decision,
        comment: Option<String>,
        now: TimeStamp<Utc>,
    ) -> Result<Self, EngineError> {
        check_gate(document, actor_id, chain)?;

        let step = document.current_step as usize;
        let next = chain.get(step);
        let current = step
            .checked_sub(1)
            .and_then(|idx| chain.get(idx))
            .filter(|e| {
                e.status == EntryStatus::Waiting
                    && e.sequence == document.current_step
                    && e.approver_id() == actor_id
            })
            .ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "document {} has no waiting entry for {} at step {}",
                    document.id, actor_id, document.current_step
                ))
            })?;

        let mut decided = current.clone();
        decided.decided_at = Some(now.clone());
        decided.comment = comment.clone();

        let mut document = document.clone();
        document.updated_at = now.clone();

        let (action, activated) = match decision {
            Decision::Reject => {
                decided.status = EntryStatus::Rejected;
                document.status = DocumentStatus::Rejected;
                document.current_approver_id = None;
                let action = HistoryAction::Reject {
                    sequence: decided.sequence,
                };
                (action, None)
            }
            Decision::Approve => {
                decided.status = EntryStatus::Approved;
                let activated = match next {
                    Some(next) => {
                        if next.status != EntryStatus::NotReached
                            || next.sequence != decided.sequence + 1
                        {
                            return Err(EngineError::InvalidState(format!(
                                "document {} step {} is {} instead of {}",
                                document.id,
                                next.sequence,
                                next.status,
                                EntryStatus::NotReached
                            )));
                        }
                        let mut next = next.clone();
                        next.status = EntryStatus::Waiting;
                        document.current_step = next.sequence;
                        document.current_approver_id = Some(next.approver_id().to_string());
                        Some(next)
                    }
                    None => {
                        document.status = DocumentStatus::Approved;
                        document.current_approver_id = None;
                        None
                    }
                };
                let action = HistoryAction::Approve {
                    sequence: decided.sequence,
                };
                (action, activated)
            }
        };

        let record = HistoryRecord::new(
            document.id.clone(),
            actor_id.to_string(),
            action,
            comment,
            now,
        );

        Ok(Self {
            document,
            decided,
            activated,
            record,
        })
    }
}

/// Checks the document/chain invariants. `chain` must be ordered by sequence.
pub fn check_invariants(document: &ApprovalDocument, chain: &[ChainEntry]) -> Result<(), String> {
    let waiting: Vec<&ChainEntry> = chain
        .iter()
        .filter(|e| e.status == EntryStatus::Waiting)
        .collect();

    match document.status {
        DocumentStatus::Pending => {
            let [entry] = waiting.as_slice() else {
                return Err(format!(
                    "pending document has {} waiting entries",
                    waiting.len()
                ));
            };
            if document.current_approver_id.as_deref() != Some(entry.approver_id()) {
                return Err("current approver does not match the waiting entry".into());
            }
            if entry.sequence != document.current_step {
                return Err("current step does not match the waiting entry".into());
            }
        }
        _ => {
            if !waiting.is_empty() {
                return Err("terminal document still has a waiting entry".into());
            }
            if document.current_approver_id.is_some() {
                return Err("terminal document still names a current approver".into());
            }
        }
    }

    // approved prefix, then at most one waiting or rejected, then not reached
    let mut phase = 0;
    for (idx, entry) in chain.iter().enumerate() {
        if entry.sequence != idx as u32 + 1 {
            return Err(format!("sequence gap at position {}", idx + 1));
        }
        let rank = match entry.status {
            EntryStatus::Approved => 0,
            EntryStatus::Waiting | EntryStatus::Rejected => 1,
            EntryStatus::NotReached => 2,
        };
        if rank < phase {
            return Err(format!(
                "entry {} is {} out of order",
                entry.sequence, entry.status
            ));
        }
        phase = if rank == 1 { 2 } else { rank.max(phase) };
    }

    if document.status == DocumentStatus::Approved
        && chain.iter().any(|e| e.status != EntryStatus::Approved)
    {
        return Err("approved document has undecided entries".into());
    }
    if document.status == DocumentStatus::Rejected
        && !chain.iter().any(|e| e.status == EntryStatus::Rejected)
    {
        return Err("rejected document has no rejecting entry".into());
    }

    Ok(())
}
