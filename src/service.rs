//! Service layer API for approval workflow operations
use super::auth::AuthorizationContext;
use super::chain::{self, ChainEntry, Decision, EntryStatus, HistoryRecord, Referrer};
use super::config::EngineConfig;
use super::document::{ApprovalDocument, ApprovalDraft, DocumentStatus, TimeStamp};
use super::error::{EngineError, StoreError, ValidationError};
use super::notify::{
    Notification, NotificationDispatcher, NotificationSink, NotificationType, SledNotifier,
};
use super::store::{DecisionCommit, DocumentStore, SledStore};
use super::utils::{DOCUMENT_HRP, new_uuid_to_bech32};
use sled::Db;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything shown on a document's detail page.
#[derive(Debug, Clone)]
pub struct DocumentView {
    pub document: ApprovalDocument,
    pub chain: Vec<ChainEntry>,
    pub referrers: Vec<Referrer>,
    pub history: Vec<HistoryRecord>,
}

pub struct ApprovalService<S, N> {
    store: S,
    dispatcher: NotificationDispatcher<N>,
    config: EngineConfig,
}

impl ApprovalService<SledStore, SledNotifier> {
    /// Open (or create) the sled database named in the config.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let db = sled::open(&config.db_path).map_err(StoreError::from)?;
        Self::with_db(Arc::new(db), config)
    }

    pub fn with_db(instance: Arc<Db>, config: EngineConfig) -> Result<Self, EngineError> {
        let store = SledStore::new(Arc::clone(&instance))?;
        let notifier = SledNotifier::new(instance)?;
        Ok(Self::new(store, notifier, config))
    }
}

impl<S: DocumentStore, N: NotificationSink> ApprovalService<S, N> {
    pub fn new(store: S, sink: N, config: EngineConfig) -> Self {
        let dispatcher = NotificationDispatcher::new(sink, config.notify_attempts);
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a new document and activate its first approver
    pub fn submit_document(
        &self,
        ctx: &AuthorizationContext,
        draft: ApprovalDraft,
    ) -> Result<String, EngineError> {
        if !ctx.is_authenticated() {
            return Err(ValidationError::Unauthenticated.into());
        }
        let content_hash = draft.validate_and_finalise(self.config.max_approvers)?;

        let document_id = new_uuid_to_bech32(DOCUMENT_HRP)
            .map_err(|e| StoreError::Identity(e.to_string()))?;
        let (document, chain, referrers) = ApprovalDocument::from_draft(
            document_id,
            &ctx.user_id,
            &draft,
            content_hash,
            TimeStamp::new(),
        )?;

        // document, chain and submit record land together or not at all
        let record = HistoryRecord::submitted(&document, &chain);
        self.store.create_document(&document, &chain, &record)?;

        info!(
            document_id = %document.id,
            author = %document.author_id,
            document_type = document.document_type.as_str(),
            steps = chain.len(),
            "approval document submitted"
        );

        if !referrers.is_empty() {
            if let Err(e) = self.store.insert_referrers(&referrers) {
                warn!(error = %e, document_id = %document.id, "failed to store referrers");
            }
        }

        if let Some(first) = chain.first() {
            self.dispatcher.notify(
                first.approver_id(),
                NotificationType::ApprovalRequest,
                &format!("New approval request: {}", document.title),
                &self.config.document_link(&document.id),
            );
        }

        Ok(document.id)
    }

    /// Record an approve/reject from the current gating approver
    pub fn decide_document(
        &self,
        ctx: &AuthorizationContext,
        document_id: &str,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<DocumentStatus, EngineError> {
        self.decide(ctx, document_id, decision, comment)
            .inspect_err(|e| log_rejected_decision(document_id, &ctx.user_id, e))
    }

    fn decide(
        &self,
        ctx: &AuthorizationContext,
        document_id: &str,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<DocumentStatus, EngineError> {
        let document = self
            .store
            .get_document(document_id)?
            .ok_or_else(|| EngineError::NotFound(document_id.to_string()))?;

        let entries = self.store.chain(document_id)?;
        chain::check_gate(&document, &ctx.user_id, &entries)?;
        if self
            .store
            .get_chain_entry(document_id, &ctx.user_id, EntryStatus::Waiting)?
            .is_none()
        {
            return Err(EngineError::InvalidState(format!(
                "document {} names {} as approver but no entry is waiting",
                document_id, ctx.user_id
            )));
        }

        let comment = comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if decision == Decision::Reject && self.config.require_reject_comment && comment.is_none()
        {
            return Err(ValidationError::MissingRejectComment.into());
        }

        let transition = self.store.apply_decision(&DecisionCommit {
            document_id: document_id.to_string(),
            actor_id: ctx.user_id.clone(),
            decision,
            comment,
            decided_at: TimeStamp::new(),
        })?;

        let document = &transition.document;
        info!(
            document_id = %document.id,
            approver = %ctx.user_id,
            sequence = transition.decided.sequence,
            status = %document.status,
            "approval decision recorded"
        );

        let link = self.config.document_link(&document.id);
        match (document.status, &transition.activated) {
            (DocumentStatus::Pending, Some(next)) => {
                self.dispatcher.notify(
                    next.approver_id(),
                    NotificationType::ApprovalRequest,
                    &format!("New approval request: {}", document.title),
                    &link,
                );
            }
            (DocumentStatus::Rejected, _) => {
                self.dispatcher.notify(
                    &document.author_id,
                    NotificationType::ApprovalRejected,
                    &format!(
                        "\"{}\" was rejected by {}",
                        document.title, transition.decided.approver.name
                    ),
                    &link,
                );
            }
            (DocumentStatus::Approved, _) => {
                self.dispatcher.notify(
                    &document.author_id,
                    NotificationType::ApprovalApproved,
                    &format!("\"{}\" has been fully approved", document.title),
                    &link,
                );
                self.notify_referrers(document, &link);
            }
            (DocumentStatus::Pending, None) => {
                // compute() never leaves a pending document without a gate
                error!(document_id = %document.id, "pending document has no next approver");
            }
        }

        Ok(document.status)
    }

    fn notify_referrers(&self, document: &ApprovalDocument, link: &str) {
        let referrers = match self.store.referrers(&document.id) {
            Ok(referrers) => referrers,
            Err(e) => {
                warn!(error = %e, document_id = %document.id, "failed to load referrers");
                return;
            }
        };
        for r in &referrers {
            self.dispatcher.notify(
                &r.referrer.user_id,
                NotificationType::ApprovalCompleted,
                &format!("\"{}\" you were copied on has been approved", document.title),
                link,
            );
        }
    }

    /// Document with its chain, referrers and history. Visible to the author,
    /// chain members, referrers and administrators.
    pub fn document(
        &self,
        ctx: &AuthorizationContext,
        document_id: &str,
    ) -> Result<DocumentView, EngineError> {
        let document = self
            .store
            .get_document(document_id)?
            .ok_or_else(|| EngineError::NotFound(document_id.to_string()))?;
        let chain = self.store.chain(document_id)?;
        let referrers = self.store.referrers(document_id)?;

        let visible = ctx.is_admin
            || document.author_id == ctx.user_id
            || chain.iter().any(|e| e.approver_id() == ctx.user_id)
            || referrers.iter().any(|r| r.referrer.user_id == ctx.user_id);
        if !visible {
            return Err(EngineError::NotAuthorized {
                document_id: document.id,
                user_id: ctx.user_id.clone(),
            });
        }

        if let Err(reason) = chain::check_invariants(&document, &chain) {
            error!(document_id = %document.id, %reason, "approval chain invariant broken");
        }

        let history = self.store.history(document_id)?;
        Ok(DocumentView {
            document,
            chain,
            referrers,
            history,
        })
    }

    /// Pending documents waiting on the caller, oldest first.
    pub fn inbox(&self, ctx: &AuthorizationContext) -> Result<Vec<ApprovalDocument>, EngineError> {
        Ok(self.store.documents_awaiting(&ctx.user_id)?)
    }

    /// The caller's own documents, newest first.
    pub fn submitted(
        &self,
        ctx: &AuthorizationContext,
    ) -> Result<Vec<ApprovalDocument>, EngineError> {
        Ok(self.store.documents_by_author(&ctx.user_id)?)
    }

    pub fn notifications(
        &self,
        ctx: &AuthorizationContext,
    ) -> Result<Vec<Notification>, EngineError> {
        Ok(self.dispatcher.sink().for_recipient(&ctx.user_id)?)
    }

    pub fn mark_notification_read(
        &self,
        ctx: &AuthorizationContext,
        notification_id: u64,
    ) -> Result<(), EngineError> {
        if self
            .dispatcher
            .sink()
            .mark_read(&ctx.user_id, notification_id)?
        {
            Ok(())
        } else {
            Err(EngineError::NotificationNotFound(notification_id))
        }
    }
}

fn log_rejected_decision(document_id: &str, user_id: &str, err: &EngineError) {
    match err {
        EngineError::InvalidState(reason) => {
            error!(document_id = %document_id, user = %user_id, %reason, "approval chain out of sync")
        }
        EngineError::Store(e) => {
            error!(document_id = %document_id, user = %user_id, error = %e, "decision not recorded")
        }
        other => {
            warn!(document_id = %document_id, user = %user_id, error = %other, "decision refused")
        }
    }
}
