//! Keeps the knowledge store in step with intervention records.
//!
//! Record lifecycle events (created, updated, deleted) arrive through
//! `POST /hooks/interventions` and are applied in the background; the bulk
//! `maint index` command embeds existing records from a JSON export.
//!
//! Each intervention is stored as one document with id
//! `intervention_{reference}_{pk}`. Lifecycle handlers never fail: they
//! return `false` and log when the store or the embedding model is
//! unavailable or a write fails.
//!
//! Background events for the same document apply in the order they were
//! spawned, so a delete is never undone by a slower create or update
//! that arrived before it.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use maint_assist_core::conversation::ConversationStore;
use maint_assist_core::embedding::Embedder;
use maint_assist_core::models::{KnowledgeDocument, Metadata};
use maint_assist_core::names::Roster;
use maint_assist_core::store::KnowledgeStore;
use maint_assist_core::AdapterError;

use crate::config::Config;
use crate::context::PipelineContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    Medium,
    High,
    Critical,
}

impl Criticality {
    pub fn as_str(self) -> &'static str {
        match self {
            Criticality::Low => "low",
            Criticality::Medium => "medium",
            Criticality::High => "high",
            Criticality::Critical => "critical",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Criticality::Low => "Low",
            Criticality::Medium => "Medium",
            Criticality::High => "High",
            Criticality::Critical => "Critical",
        }
    }
}

/// A maintenance intervention record as exported by the tracking
/// application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub reference: String,
    pub pk: i64,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub subsidiary: String,
    pub criticality: Criticality,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub technicians: String,
    #[serde(default)]
    pub supervisors: String,
    #[serde(default)]
    pub issued_by: String,
    pub intervention_date: NaiveDateTime,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub recommendations: Option<String>,
    /// File names of attached documents.
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// A free-form knowledge document for `maint index --format documents`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

pub fn document_id(reference: &str, pk: i64) -> String {
    format!("intervention_{}_{}", reference, pk)
}

fn iso(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Multi-line text embedded for an intervention. `technicians` is the
/// already-canonicalized technician list.
pub fn intervention_text(record: &Intervention, technicians: &str) -> String {
    let mut parts = vec![
        format!("INTERVENTION {}", record.reference),
        format!("Subject: {}", record.subject),
        format!("Description: {}", record.description),
        format!("Machine: {}", record.machine),
        format!("Subsidiary: {}", record.subsidiary),
        format!("Criticality: {}", record.criticality.label()),
        format!("Contact: {}", record.contact),
        format!("Phone: {}", record.phone),
        format!("Technicians: {}", technicians),
        format!("Supervisors: {}", record.supervisors),
        format!("Issued by: {}", record.issued_by),
        format!(
            "Intervention date: {}",
            record.intervention_date.format("%d/%m/%Y %H:%M")
        ),
    ];

    if let Some(rec) = record.recommendations.as_deref().filter(|r| !r.is_empty()) {
        parts.push(format!("Recommendations: {}", rec));
    }
    if !record.attachments.is_empty() {
        parts.push(format!("Attached documents: {}", record.attachments.join(", ")));
    }

    parts.join("\n")
}

pub fn intervention_metadata(record: &Intervention, updated: bool) -> Metadata {
    let has_recommendations = record
        .recommendations
        .as_deref()
        .is_some_and(|r| !r.is_empty());

    let mut meta = Metadata::new();
    meta.insert("source".into(), json!(format!("Intervention_{}", record.reference)));
    meta.insert("type".into(), json!("intervention"));
    meta.insert("reference".into(), json!(record.reference));
    meta.insert("criticality".into(), json!(record.criticality.as_str()));
    meta.insert("machine".into(), json!(record.machine));
    meta.insert("subsidiary".into(), json!(record.subsidiary));
    meta.insert("contact".into(), json!(record.contact));
    meta.insert("intervention_date".into(), json!(iso(&record.intervention_date)));
    meta.insert("created_at".into(), json!(iso(&record.created_at)));
    meta.insert("year".into(), json!(record.intervention_date.year()));
    meta.insert("month".into(), json!(record.intervention_date.month()));
    meta.insert("has_recommendations".into(), json!(has_recommendations));

    if updated {
        if let Some(at) = &record.updated_at {
            meta.insert("updated_at".into(), json!(iso(at)));
        }
        meta.insert("updated".into(), json!(true));
    }
    meta
}

/// Outcome of a bulk run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Last pending background event per document id. Each event waits for
/// the one spawned before it.
#[derive(Default)]
struct EventChains {
    seq: u64,
    tails: HashMap<String, (u64, oneshot::Receiver<()>)>,
}

pub struct Indexer {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    conversations: ConversationStore,
    invalidate_on_write: bool,
    roster: Mutex<Roster>,
    chains: Mutex<EventChains>,
}

impl Indexer {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            store: ctx.store.clone(),
            embedder: ctx.embedder.clone(),
            conversations: ctx.conversations.clone(),
            invalidate_on_write: ctx.config.cache.invalidate_on_write,
            roster: Mutex::new(Roster::new(&ctx.config.knowledge.technicians)),
            chains: Mutex::new(EventChains::default()),
        }
    }

    fn ready(&self, action: &str, reference: &str) -> bool {
        if !self.store.is_available() || !self.embedder.is_available() {
            tracing::warn!(reference, action, "knowledge store or embedding model unavailable; skipping");
            return false;
        }
        true
    }

    /// Technician names that were not in the configured roster.
    pub fn new_technicians(&self) -> Vec<String> {
        self.roster.lock().added().to_vec()
    }

    async fn embed_record(&self, record: &Intervention, updated: bool) -> Result<(), AdapterError> {
        let technicians = self.roster.lock().resolve(&record.technicians).join(", ");
        let text = intervention_text(record, &technicians);
        let embedding = self.embedder.embed(&text).await?;
        let doc = KnowledgeDocument {
            id: document_id(&record.reference, record.pk),
            text,
            metadata: intervention_metadata(record, updated),
            embedding,
        };
        self.store.upsert(&doc).await?;
        self.after_write().await;
        Ok(())
    }

    async fn after_write(&self) {
        if self.invalidate_on_write {
            self.conversations.bump_knowledge_generation().await;
        }
    }

    pub async fn on_created(&self, record: &Intervention) -> bool {
        if !self.ready("create", &record.reference) {
            return false;
        }
        match self.embed_record(record, false).await {
            Ok(()) => {
                tracing::info!(reference = %record.reference, "intervention indexed");
                true
            }
            Err(e) => {
                tracing::error!(reference = %record.reference, error = %e, "failed to index intervention");
                false
            }
        }
    }

    /// Re-embed an intervention. A record that was never indexed is
    /// created instead.
    pub async fn on_updated(&self, record: &Intervention) -> bool {
        if !self.ready("update", &record.reference) {
            return false;
        }
        let id = document_id(&record.reference, record.pk);
        match self.store.contains(&id).await {
            Ok(true) => {}
            Ok(false) => return self.on_created(record).await,
            Err(e) => {
                tracing::error!(reference = %record.reference, error = %e, "failed to look up intervention");
                return false;
            }
        }
        match self.embed_record(record, true).await {
            Ok(()) => {
                tracing::info!(reference = %record.reference, "intervention re-indexed");
                true
            }
            Err(e) => {
                tracing::error!(reference = %record.reference, error = %e, "failed to update intervention");
                false
            }
        }
    }

    pub async fn on_deleted(&self, reference: &str, pk: i64) -> bool {
        if !self.store.is_available() {
            tracing::warn!(reference, "knowledge store unavailable; skipping delete");
            return false;
        }
        match self.store.delete(&document_id(reference, pk)).await {
            Ok(existed) => {
                self.after_write().await;
                tracing::info!(reference, existed, "intervention removed from knowledge store");
                true
            }
            Err(e) => {
                tracing::error!(reference, error = %e, "failed to delete intervention");
                false
            }
        }
    }

    /// Run `apply` in the background once every earlier event for `id`
    /// has finished.
    fn spawn_in_order<F, Fut>(self: &Arc<Self>, id: String, apply: F) -> JoinHandle<bool>
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let (seq, previous) = {
            let mut chains = self.chains.lock();
            chains.seq += 1;
            let seq = chains.seq;
            let previous = chains.tails.insert(id.clone(), (seq, done_rx));
            (seq, previous.map(|(_, rx)| rx))
        };

        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(previous) = previous {
                // Err means the earlier event panicked; it is finished either way.
                let _ = previous.await;
            }
            let applied = apply(Arc::clone(&indexer)).await;
            let _ = done_tx.send(());
            {
                let mut chains = indexer.chains.lock();
                if chains.tails.get(&id).is_some_and(|(tail, _)| *tail == seq) {
                    chains.tails.remove(&id);
                }
            }
            applied
        })
    }

    pub fn spawn_created(self: &Arc<Self>, record: Intervention) -> JoinHandle<bool> {
        let id = document_id(&record.reference, record.pk);
        self.spawn_in_order(id, move |indexer| async move { indexer.on_created(&record).await })
    }

    pub fn spawn_updated(self: &Arc<Self>, record: Intervention) -> JoinHandle<bool> {
        let id = document_id(&record.reference, record.pk);
        self.spawn_in_order(id, move |indexer| async move { indexer.on_updated(&record).await })
    }

    pub fn spawn_deleted(self: &Arc<Self>, reference: String, pk: i64) -> JoinHandle<bool> {
        let id = document_id(&reference, pk);
        self.spawn_in_order(id, move |indexer| async move {
            indexer.on_deleted(&reference, pk).await
        })
    }

    /// Embed every record. Without `force`, records already stored are
    /// skipped.
    pub async fn index_all(
        &self,
        records: &[Intervention],
        force: bool,
        batch_size: usize,
    ) -> Result<IndexReport> {
        if !self.store.is_available() || !self.embedder.is_available() {
            bail!("knowledge store and embedding model must both be available to index");
        }

        let mut report = IndexReport::default();
        let total = records.len();
        for (n, batch) in records.chunks(batch_size.max(1)).enumerate() {
            for record in batch {
                let id = document_id(&record.reference, record.pk);
                if !force && self.store.contains(&id).await.unwrap_or(false) {
                    report.skipped += 1;
                    continue;
                }
                match self.embed_record(record, record.updated_at.is_some()).await {
                    Ok(()) => report.indexed += 1,
                    Err(e) => {
                        tracing::warn!(reference = %record.reference, error = %e, "failed to index intervention");
                        report.failed += 1;
                    }
                }
            }
            tracing::info!(
                done = ((n + 1) * batch_size.max(1)).min(total),
                total,
                "indexing progress"
            );
        }
        Ok(report)
    }

    /// Embed free-form documents, keeping their ids and metadata.
    pub async fn index_documents(&self, docs: &[SourceDocument], force: bool) -> Result<IndexReport> {
        if !self.store.is_available() || !self.embedder.is_available() {
            bail!("knowledge store and embedding model must both be available to index");
        }

        let mut report = IndexReport::default();
        for doc in docs {
            if !force && self.store.contains(&doc.id).await.unwrap_or(false) {
                report.skipped += 1;
                continue;
            }
            let result = match self.embedder.embed(&doc.text).await {
                Ok(embedding) => {
                    self.store
                        .upsert(&KnowledgeDocument {
                            id: doc.id.clone(),
                            text: doc.text.clone(),
                            metadata: doc.metadata.clone(),
                            embedding,
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    tracing::warn!(id = %doc.id, error = %e, "failed to index document");
                    report.failed += 1;
                }
            }
        }
        if report.indexed > 0 {
            self.after_write().await;
        }
        Ok(report)
    }
}

pub fn load_interventions(path: &Path) -> Result<Vec<Intervention>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of interventions", path.display()))
}

pub fn load_documents(path: &Path) -> Result<Vec<SourceDocument>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of documents", path.display()))
}

/// `maint index`: bulk-embed a JSON export.
pub async fn run_index(
    config: Config,
    path: &Path,
    format: &str,
    force: bool,
    batch_size: Option<usize>,
) -> Result<()> {
    let batch_size = batch_size.unwrap_or(config.embedding.batch_size);
    let ctx = PipelineContext::from_config(config).await?;
    let indexer = Indexer::new(&ctx);

    let report = match format {
        "interventions" => {
            let records = load_interventions(path)?;
            indexer.index_all(&records, force, batch_size).await?
        }
        "documents" => {
            let docs = load_documents(path)?;
            indexer.index_documents(&docs, force).await?
        }
        other => bail!("Unknown index format: {}. Use interventions or documents.", other),
    };

    println!("index {}", path.display());
    println!("  indexed: {}", report.indexed);
    println!("  skipped: {}", report.skipped);
    println!("  failed: {}", report.failed);

    let added = indexer.new_technicians();
    if !added.is_empty() {
        println!("  new technicians: {}", added.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maint_assist_core::kv::InMemoryKv;
    use maint_assist_core::llm::DisabledModel;
    use maint_assist_core::store::memory::InMemoryKnowledgeStore;

    use crate::broker::memory::InMemoryBroker;

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn record() -> Intervention {
        serde_json::from_value(json!({
            "reference": "INT-ABC123",
            "pk": 7,
            "subject": "Hydraulic leak",
            "description": "Oil under press 3",
            "machine": "Press 3",
            "subsidiary": "North",
            "criticality": "high",
            "contact": "Leila",
            "phone": "0600000000",
            "technicians": "yassine hassan",
            "supervisors": "M. Idrissi",
            "issued_by": "Planning",
            "intervention_date": "2024-03-05T14:30:00",
            "created_at": "2024-03-04T09:00:00",
            "attachments": ["report.pdf"]
        }))
        .unwrap()
    }

    /// Sleeps before each of the first `slow_calls` embeddings.
    struct SlowEmbedder {
        slow_calls: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl SlowEmbedder {
        fn new(slow_calls: usize) -> Self {
            Self {
                slow_calls,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.slow_calls {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn indexer(store: Arc<InMemoryKnowledgeStore>, technicians: Vec<String>) -> Indexer {
        indexer_with(store, technicians, Arc::new(LengthEmbedder))
    }

    fn indexer_with(
        store: Arc<InMemoryKnowledgeStore>,
        technicians: Vec<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Indexer {
        let mut config = Config::default();
        config.knowledge.technicians = technicians;
        let ctx = PipelineContext::new(
            config,
            store,
            Arc::new(InMemoryKv::new()),
            embedder,
            Arc::new(DisabledModel),
            Arc::new(InMemoryBroker::new(std::time::Duration::from_secs(60))),
        );
        Indexer::new(&ctx)
    }

    #[test]
    fn test_text_and_metadata() {
        let rec = record();
        let text = intervention_text(&rec, "Hassan Yassine");
        assert!(text.starts_with("INTERVENTION INT-ABC123\nSubject: Hydraulic leak"));
        assert!(text.contains("Criticality: High"));
        assert!(text.contains("Intervention date: 05/03/2024 14:30"));
        assert!(text.ends_with("Attached documents: report.pdf"));
        assert!(!text.contains("Recommendations"));

        let meta = intervention_metadata(&rec, false);
        assert_eq!(meta["source"], json!("Intervention_INT-ABC123"));
        assert_eq!(meta["type"], json!("intervention"));
        assert_eq!(meta["year"], json!(2024));
        assert_eq!(meta["month"], json!(3));
        assert_eq!(meta["has_recommendations"], json!(false));
        assert!(meta.get("updated").is_none());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let idx = indexer(store.clone(), vec!["Hassan Yassine".into()]);
        let mut rec = record();

        assert!(idx.on_created(&rec).await);
        let doc = store.get("intervention_INT-ABC123_7").unwrap();
        assert!(doc.text.contains("Technicians: Hassan Yassine"));
        assert!(idx.new_technicians().is_empty());

        rec.description = "Seal replaced".into();
        rec.updated_at = Some(rec.created_at);
        assert!(idx.on_updated(&rec).await);
        let doc = store.get("intervention_INT-ABC123_7").unwrap();
        assert!(doc.text.contains("Seal replaced"));
        assert_eq!(doc.metadata["updated"], json!(true));

        assert!(idx.on_deleted("INT-ABC123", 7).await);
        assert!(store.get("intervention_INT-ABC123_7").is_none());
    }

    #[tokio::test]
    async fn test_update_of_unknown_record_creates_it() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let idx = indexer(store.clone(), vec![]);
        assert!(idx.on_updated(&record()).await);
        let doc = store.get("intervention_INT-ABC123_7").unwrap();
        assert!(doc.metadata.get("updated").is_none());
    }

    #[tokio::test]
    async fn test_delete_after_slow_create_removes_document() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let idx = Arc::new(indexer_with(store.clone(), vec![], Arc::new(SlowEmbedder::new(1))));

        let created = idx.spawn_created(record());
        let deleted = idx.spawn_deleted("INT-ABC123".into(), 7);
        assert!(created.await.unwrap());
        assert!(deleted.await.unwrap());

        assert!(store.get("intervention_INT-ABC123_7").is_none());
        assert!(idx.chains.lock().tails.is_empty());
    }

    #[tokio::test]
    async fn test_updates_apply_in_arrival_order() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let idx = Arc::new(indexer_with(store.clone(), vec![], Arc::new(SlowEmbedder::new(1))));

        let mut first = record();
        first.description = "Seal inspected".into();
        let mut second = record();
        second.description = "Seal replaced".into();

        let a = idx.spawn_created(first);
        let b = idx.spawn_updated(second);
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());

        let doc = store.get("intervention_INT-ABC123_7").unwrap();
        assert!(doc.text.contains("Description: Seal replaced"));
        assert_eq!(doc.metadata["updated"], json!(true));
    }

    #[tokio::test]
    async fn test_events_for_other_documents_do_not_wait() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let idx = Arc::new(indexer_with(store.clone(), vec![], Arc::new(SlowEmbedder::new(1))));

        let slow = idx.spawn_created(record());
        let mut other = record();
        other.pk = 8;
        let fast = idx.spawn_created(other);

        assert!(fast.await.unwrap());
        assert!(store.get("intervention_INT-ABC123_8").is_some());
        assert!(store.get("intervention_INT-ABC123_7").is_none());
        assert!(slow.await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_returns_false() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        store.set_available(false);
        let idx = indexer(store, vec![]);
        assert!(!idx.on_created(&record()).await);
        assert!(!idx.on_deleted("INT-ABC123", 7).await);
    }

    #[tokio::test]
    async fn test_index_all_skips_existing_unless_forced() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let idx = indexer(store.clone(), vec![]);
        let mut other = record();
        other.pk = 8;
        let records = vec![record(), other];

        assert!(idx.on_created(&records[0]).await);
        let report = idx.index_all(&records, false, 1).await.unwrap();
        assert_eq!(report, IndexReport { indexed: 1, skipped: 1, failed: 0 });

        let report = idx.index_all(&records, true, 10).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(idx.new_technicians(), vec!["Hassan Yassine".to_string()]);
    }

    #[test]
    fn test_load_interventions_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interventions.json");
        std::fs::write(&path, serde_json::to_string(&vec![record()]).unwrap()).unwrap();
        let loaded = load_interventions(&path).unwrap();
        assert_eq!(loaded, vec![record()]);
    }
}
