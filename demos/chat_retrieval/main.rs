//! # Chat Retrieval
//!
//! Walks through the lifecycle of a conversation-scoped document index:
//! two chats upload files, each chat searches only its own passages, one
//! chat is deleted, and the index is reloaded from disk.
//!
//! Uses a local `HashedWordEmbedder` so it runs with **zero API keys**.
//!
//! Run: `cargo run -p chatdoc-demos --bin chat_retrieval`

use std::sync::Arc;

use chatdoc_rag::{EmbeddingProvider, JsonRecordStore, RetrievalConfig, RetrievalEngine};
use tracing::info;

// ---------------------------------------------------------------------------
// HashedWordEmbedder: deterministic bag-of-words embeddings for demos
// ---------------------------------------------------------------------------

struct HashedWordEmbedder {
    dimensions: usize,
}

impl HashedWordEmbedder {
    fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashedWordEmbedder {
    async fn embed(&self, text: &str) -> chatdoc_rag::Result<Vec<f32>> {
        // Each lowercase word lands in one bucket; shared vocabulary means
        // nearby vectors.
        let mut emb = vec![0.0f32; self.dimensions];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| w.len() > 2) {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            emb[(hash % self.dimensions as u64) as usize] += 1.0;
        }
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            emb.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(emb)
    }

    fn name(&self) -> &str {
        "hashed-words"
    }
}

const RELEASE_NOTES: &str = "Version 3.2 adds file locking for shared workspaces. \
    The new doctor command diagnoses stuck uploads. Upload speed improved by forty percent \
    with parallel chunk uploads. A bug where ignore patterns skipped nested folders was fixed.";

const TEAM_HANDBOOK: &str = "New hires receive a laptop on their first day. \
    Expense reports are due by the fifth of each month. The office is closed on public \
    holidays. Ask the people team about parental leave and remote work allowances.";

const SUPPORT_FAQ: &str = "If uploads are stuck, run the doctor command first. \
    Authentication tokens expire after a day of inactivity; log in again to refresh them. \
    Conflicts appear when two people edit the same file, and file locking prevents them.";

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatdoc_telemetry::init_telemetry("chat_retrieval");

    let data_dir = tempfile::tempdir()?;
    let config = RetrievalConfig::builder()
        .chunk_size(160)
        .chunk_overlap(8)
        .top_k(3)
        .similarity_threshold(0.4)
        .build()?;

    let build_engine = |config: RetrievalConfig| -> anyhow::Result<RetrievalEngine> {
        Ok(RetrievalEngine::builder()
            .config(config)
            .embedding_provider(Arc::new(HashedWordEmbedder::new(64)))
            .record_store(Arc::new(JsonRecordStore::open(data_dir.path())?))
            .build()?)
    };
    let engine = build_engine(config.clone())?;
    engine.load_from_disk().await?;

    // Two conversations upload their files.
    println!("Ingesting uploads...");
    for (text, source, chat) in [
        (RELEASE_NOTES, "release-notes.md", "chat-product"),
        (SUPPORT_FAQ, "support-faq.pdf", "chat-product"),
        (TEAM_HANDBOOK, "handbook.docx", "chat-hr"),
    ] {
        let report = engine.ingest_text(text, source, Some(chat), None).await?;
        println!(
            "  {source} -> {chat}: {}/{} chunks in {:?}",
            report.added, report.requested, report.elapsed
        );
    }

    // Each chat only sees its own passages.
    for (chat, question) in [
        ("chat-product", "how do I fix stuck uploads"),
        ("chat-hr", "when are expense reports due"),
        ("chat-hr", "how do I fix stuck uploads"),
    ] {
        let hits = engine.search(question, Some(chat)).await?;
        println!("\n[{chat}] {question}: {} hit(s)", hits.len());
        for hit in hits {
            println!(
                "  {:.3}  {}  {}",
                hit.similarity,
                hit.document.source,
                hit.document.content.chars().take(70).collect::<String>()
            );
        }
    }

    let stats = engine.statistics(None).await;
    println!("\nIndex statistics: {}", serde_json::to_string_pretty(&stats)?);

    // Deleting a conversation removes its passages from memory and disk.
    let removed = engine.delete_by_partition("chat-hr").await?;
    info!(removed, "deleted chat-hr");
    println!("\nDeleted chat-hr: {removed} passage(s) removed");

    engine.flush().await?;
    drop(engine);

    // A restarted process sees exactly the surviving passages.
    let restarted = build_engine(config)?;
    let loaded = restarted.load_from_disk().await?;
    println!("Reloaded {loaded} passage(s) from {}", data_dir.path().display());
    for summary in restarted.list_documents(None).await {
        println!(
            "  {}  {}  chat={}",
            summary.id,
            summary.source,
            summary.partition_key.as_deref().unwrap_or("<global>")
        );
    }

    Ok(())
}
