//! Persistence of documents, chains, referrers and history
//!
//! [`DocumentStore`] is the seam the service talks to. [`SledStore`] keeps one
//! tree per entity and writes multi-row changes inside a single sled
//! transaction, so a document is never visible without its chain and a
//! decision never lands half applied.
use super::chain::{ChainEntry, Decision, EntryStatus, HistoryRecord, Referrer, Transition};
use super::document::{ApprovalDocument, TimeStamp};
use super::error::{EngineError, StoreError};
use super::utils::{key_scope, scoped_key};
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Batch, Db, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A decision to commit. The store re-checks the gates against the rows it
/// commits over, so two racing commits cannot both advance the chain.
#[derive(Debug, Clone)]
pub struct DecisionCommit {
    pub document_id: String,
    pub actor_id: String,
    pub decision: Decision,
    pub comment: Option<String>,
    pub decided_at: TimeStamp<Utc>,
}

pub trait DocumentStore: Send + Sync {
    /// Write the document, its whole chain and the submit record as one unit.
    fn create_document(
        &self,
        document: &ApprovalDocument,
        chain: &[ChainEntry],
        record: &HistoryRecord,
    ) -> Result<(), StoreError>;

    fn insert_referrers(&self, referrers: &[Referrer]) -> Result<(), StoreError>;

    fn get_document(&self, document_id: &str) -> Result<Option<ApprovalDocument>, StoreError>;

    fn get_chain_entry(
        &self,
        document_id: &str,
        approver_id: &str,
        status: EntryStatus,
    ) -> Result<Option<ChainEntry>, StoreError>;

    /// Atomically update the waiting entry, the entry after it, the document
    /// and append the history record.
    fn apply_decision(&self, commit: &DecisionCommit) -> Result<Transition, EngineError>;

    fn chain(&self, document_id: &str) -> Result<Vec<ChainEntry>, StoreError>;

    fn referrers(&self, document_id: &str) -> Result<Vec<Referrer>, StoreError>;

    fn history(&self, document_id: &str) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Pending documents whose gate is `approver_id`.
    fn documents_awaiting(&self, approver_id: &str) -> Result<Vec<ApprovalDocument>, StoreError>;

    fn documents_by_author(&self, author_id: &str) -> Result<Vec<ApprovalDocument>, StoreError>;
}

pub struct SledStore {
    instance: Arc<Db>,
    documents: Tree,
    chain: Tree,
    referrers: Tree,
    history: Tree,
}

fn chain_key(document_id: &str, sequence: u32) -> Result<Vec<u8>, StoreError> {
    scoped_key(document_id, &sequence.to_be_bytes())
}

fn child_key(document_id: &str, id: u64) -> Result<Vec<u8>, StoreError> {
    scoped_key(document_id, &id.to_be_bytes())
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(minicbor::to_vec(value)?)
}

fn abort_on<T>(result: Result<T, StoreError>) -> ConflictableTransactionResult<T, EngineError> {
    result.map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn flatten<E: From<StoreError>>(err: TransactionError<E>) -> E {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Database(e).into(),
    }
}

fn read_entry(
    chain: &TransactionalTree,
    document_id: &str,
    sequence: u32,
) -> ConflictableTransactionResult<Option<ChainEntry>, EngineError> {
    match chain.get(abort_on(chain_key(document_id, sequence))?)? {
        Some(bytes) => {
            let entry = abort_on(minicbor::decode(&bytes).map_err(StoreError::from))?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

// Sequences are dense from 1, so the chain ends at the first missing step.
fn read_chain(
    chain: &TransactionalTree,
    document_id: &str,
) -> ConflictableTransactionResult<Vec<ChainEntry>, EngineError> {
    let mut entries = Vec::new();
    while let Some(entry) = read_entry(chain, document_id, entries.len() as u32 + 1)? {
        entries.push(entry);
    }
    Ok(entries)
}

impl SledStore {
    pub fn new(instance: Arc<Db>) -> Result<Self, StoreError> {
        let documents = instance.open_tree("documents")?;
        let chain = instance.open_tree("chain")?;
        let referrers = instance.open_tree("referrers")?;
        let history = instance.open_tree("history")?;

        Ok(Self {
            instance,
            documents,
            chain,
            referrers,
            history,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(Arc::new(sled::open(path)?))
    }

    /// The underlying database, for sharing with other trees (notifications).
    pub fn instance(&self) -> Arc<Db> {
        Arc::clone(&self.instance)
    }

    fn scan<T>(&self, tree: &Tree, owner: &str) -> Result<Vec<T>, StoreError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        tree.scan_prefix(key_scope(owner)?)
            .map(|item| -> Result<T, StoreError> {
                let (_, bytes) = item?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }

    fn all_documents(&self) -> Result<Vec<ApprovalDocument>, StoreError> {
        self.documents
            .iter()
            .map(|item| -> Result<ApprovalDocument, StoreError> {
                let (_, bytes) = item?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }
}

impl DocumentStore for SledStore {
    fn create_document(
        &self,
        document: &ApprovalDocument,
        chain: &[ChainEntry],
        record: &HistoryRecord,
    ) -> Result<(), StoreError> {
        let document_cbor = encode(document)?;
        let entries = chain
            .iter()
            .map(|entry| -> Result<(Vec<u8>, Vec<u8>), StoreError> {
                Ok((chain_key(&entry.document_id, entry.sequence)?, encode(entry)?))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let record_key = child_key(&document.id, self.instance.generate_id()?)?;
        let record_cbor = encode(record)?;

        (&self.documents, &self.chain, &self.history)
            .transaction(
                |(documents, chain, history)| -> ConflictableTransactionResult<(), StoreError> {
                    documents.insert(document.id.as_bytes(), document_cbor.as_slice())?;
                    for (key, cbor) in &entries {
                        chain.insert(key.as_slice(), cbor.as_slice())?;
                    }
                    history.insert(record_key.as_slice(), record_cbor.as_slice())?;
                    Ok(())
                },
            )
            .map_err(flatten)?;

        debug!(document_id = %document.id, steps = chain.len(), "document and chain written");
        Ok(())
    }

    fn insert_referrers(&self, referrers: &[Referrer]) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        for (idx, referrer) in referrers.iter().enumerate() {
            let key = child_key(&referrer.document_id, idx as u64)?;
            batch.insert(key, encode(referrer)?);
        }
        self.referrers.apply_batch(batch)?;
        Ok(())
    }

    fn get_document(&self, document_id: &str) -> Result<Option<ApprovalDocument>, StoreError> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_chain_entry(
        &self,
        document_id: &str,
        approver_id: &str,
        status: EntryStatus,
    ) -> Result<Option<ChainEntry>, StoreError> {
        let entry = self
            .chain(document_id)?
            .into_iter()
            .find(|e| e.approver_id() == approver_id && e.status == status);
        Ok(entry)
    }

    fn apply_decision(&self, commit: &DecisionCommit) -> Result<Transition, EngineError> {
        let record_key = child_key(
            &commit.document_id,
            self.instance.generate_id().map_err(StoreError::from)?,
        )?;

        let transition = (&self.documents, &self.chain, &self.history)
            .transaction(|(documents, chain, history)| -> ConflictableTransactionResult<
                Transition,
                EngineError,
            > {
                let Some(bytes) = documents.get(commit.document_id.as_bytes())? else {
                    return Err(ConflictableTransactionError::Abort(EngineError::NotFound(
                        commit.document_id.clone(),
                    )));
                };
                let document: ApprovalDocument =
                    abort_on(minicbor::decode(&bytes).map_err(StoreError::from))?;

                let entries = read_chain(chain, &document.id)?;

                let transition = Transition::compute(
                    &document,
                    &commit.actor_id,
                    &entries,
                    commit.decision,
                    commit.comment.clone(),
                    commit.decided_at.clone(),
                )
                .map_err(ConflictableTransactionError::Abort)?;

                let decided = &transition.decided;
                chain.insert(
                    abort_on(chain_key(&document.id, decided.sequence))?,
                    abort_on(encode(decided))?,
                )?;
                if let Some(activated) = &transition.activated {
                    chain.insert(
                        abort_on(chain_key(&document.id, activated.sequence))?,
                        abort_on(encode(activated))?,
                    )?;
                }
                documents.insert(
                    document.id.as_bytes(),
                    abort_on(encode(&transition.document))?,
                )?;
                history.insert(record_key.as_slice(), abort_on(encode(&transition.record))?)?;

                Ok(transition)
            })
            .map_err(flatten)?;

        debug!(
            document_id = %commit.document_id,
            sequence = transition.decided.sequence,
            status = %transition.document.status,
            "decision committed"
        );
        Ok(transition)
    }

    fn chain(&self, document_id: &str) -> Result<Vec<ChainEntry>, StoreError> {
        self.scan(&self.chain, document_id)
    }

    fn referrers(&self, document_id: &str) -> Result<Vec<Referrer>, StoreError> {
        self.scan(&self.referrers, document_id)
    }

    fn history(&self, document_id: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        self.scan(&self.history, document_id)
    }

    fn documents_awaiting(&self, approver_id: &str) -> Result<Vec<ApprovalDocument>, StoreError> {
        let mut docs: Vec<ApprovalDocument> = self
            .all_documents()?
            .into_iter()
            .filter(|d| d.is_pending() && d.current_approver_id.as_deref() == Some(approver_id))
            .collect();
        docs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(docs)
    }

    fn documents_by_author(&self, author_id: &str) -> Result<Vec<ApprovalDocument>, StoreError> {
        let mut docs: Vec<ApprovalDocument> = self
            .all_documents()?
            .into_iter()
            .filter(|d| d.author_id == author_id)
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ApprovalDraft, DocumentType, Participant};
    use tempfile::tempdir;

    #[test]
    fn chain_reads_back_in_sequence_order() {
        let temp_dir = tempdir().unwrap();
        let store = SledStore::open(temp_dir.path().join("store.db")).unwrap();

        let draft = (1..=12).fold(
            ApprovalDraft::new()
                .set_title("Long chain")
                .set_document_type(DocumentType::GenericForm),
            |d, n| d.add_approver(Participant::new(&format!("user_{n}"), "", "")),
        );
        let hash = draft.validate_and_finalise(20).unwrap();
        let (doc, chain, _) =
            ApprovalDocument::from_draft("doc_x".into(), "author", &draft, hash, TimeStamp::new())
                .unwrap();
        let record = HistoryRecord::submitted(&doc, &chain);

        store.create_document(&doc, &chain, &record).unwrap();

        let stored = store.chain("doc_x").unwrap();
        let sequences: Vec<u32> = stored.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=12).collect::<Vec<u32>>());
        assert_eq!(store.history("doc_x").unwrap(), vec![record]);
    }

    #[test]
    fn chain_past_four_digit_sequences_stays_ordered() {
        let temp_dir = tempdir().unwrap();
        let store = SledStore::open(temp_dir.path().join("store.db")).unwrap();
        let steps = 10_001;

        let draft = (1..=steps).fold(
            ApprovalDraft::new()
                .set_title("Very long chain")
                .set_document_type(DocumentType::GenericForm),
            |d, n| d.add_approver(Participant::new(&format!("user_{n}"), "", "")),
        );
        let hash = draft.validate_and_finalise(steps as usize).unwrap();
        let (doc, chain, _) =
            ApprovalDocument::from_draft("doc_y".into(), "author", &draft, hash, TimeStamp::new())
                .unwrap();
        store
            .create_document(&doc, &chain, &HistoryRecord::submitted(&doc, &chain))
            .unwrap();

        let stored = store.chain("doc_y").unwrap();
        assert_eq!(stored.len(), steps as usize);
        assert!(crate::chain::check_invariants(&doc, &stored).is_ok());
        assert_eq!(stored[1000].sequence, 1001);
        assert_eq!(stored.last().unwrap().sequence, steps);
    }

    #[test]
    fn awaiting_is_oldest_first_and_authored_newest_first() {
        let temp_dir = tempdir().unwrap();
        let store = SledStore::open(temp_dir.path().join("store.db")).unwrap();
        let draft = ApprovalDraft::new()
            .set_title("Leave")
            .set_document_type(DocumentType::GenericForm)
            .add_approver(Participant::new("user_a", "", ""));
        let hash = draft.validate_and_finalise(10).unwrap();

        for (id, hour) in [("doc_late", 11), ("doc_early", 9), ("doc_mid", 10)] {
            let at = TimeStamp::new_with(2024, 3, 4, hour, 0, 0).unwrap();
            let (doc, chain, _) =
                ApprovalDocument::from_draft(id.into(), "author", &draft, hash.clone(), at)
                    .unwrap();
            store
                .create_document(&doc, &chain, &HistoryRecord::submitted(&doc, &chain))
                .unwrap();
        }

        let awaiting: Vec<String> = store
            .documents_awaiting("user_a")
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        let authored: Vec<String> = store
            .documents_by_author("author")
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();

        assert_eq!(awaiting, ["doc_early", "doc_mid", "doc_late"]);
        assert_eq!(authored, ["doc_late", "doc_mid", "doc_early"]);
    }

    #[test]
    fn missing_document_aborts_commit() {
        let temp_dir = tempdir().unwrap();
        let store = SledStore::open(temp_dir.path().join("store.db")).unwrap();

        let err = store
            .apply_decision(&DecisionCommit {
                document_id: "doc_missing".into(),
                actor_id: "user_a".into(),
                decision: Decision::Approve,
                comment: None,
                decided_at: TimeStamp::new(),
            })
            .unwrap_err();

        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(store.history("doc_missing").unwrap().is_empty());
    }
}
