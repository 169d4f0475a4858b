//! End-to-end behavior of the retrieval engine over deterministic embeddings.

mod common;

use std::sync::Arc;

use chatdoc_rag::{
    Document, DocumentRecord, InMemoryRecordStore, JsonRecordStore, Metadata, RagError,
    RecordStore, RetrievalConfig, RetrievalEngine, ScoredDocument,
};
use chatdoc_telemetry::{CaptureLayer, CapturedEvents};
use serde_json::json;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

use common::{KeywordEmbedder, RejectingRecordStore, engine_with, memory_engine, open_config};

fn ids(hits: &[ScoredDocument]) -> Vec<String> {
    hits.iter().map(|hit| hit.document.id.clone()).collect()
}

async fn ingest_one(engine: &RetrievalEngine, text: &str, source: &str, partition: Option<&str>) {
    let report = engine.ingest(&[text], source, partition, &Metadata::new()).await.unwrap();
    assert!(report.is_complete(), "ingest of {text:?} was partial: {report:?}");
}

#[tokio::test]
async fn partition_scoped_query_only_sees_its_partition() {
    let (engine, _, _) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", Some("A")).await;
    ingest_one(&engine, "apple", "b.txt", Some("A")).await;
    ingest_one(&engine, "apple", "c.txt", Some("B")).await;

    let scoped = engine.query("apple", Some("A"), 10, 0.0).await.unwrap();
    assert_eq!(scoped.len(), 2);
    assert!(scoped.iter().all(|hit| hit.document.partition_key.as_deref() == Some("A")));

    let global = engine.query("apple", None, 10, 0.0).await.unwrap();
    assert_eq!(global.len(), 3);
}

#[tokio::test]
async fn empty_scope_returns_nothing_without_embedding() {
    let (engine, embedder, _) = memory_engine();
    assert!(engine.query("apple", None, 5, 0.0).await.unwrap().is_empty());
    assert_eq!(embedder.calls(), 0);

    ingest_one(&engine, "apple", "a.txt", Some("A")).await;
    let calls = embedder.calls();
    assert!(engine.query("apple", Some("missing"), 5, 0.0).await.unwrap().is_empty());
    assert!(engine.query("apple", None, 0, 0.0).await.unwrap().is_empty());
    assert_eq!(embedder.calls(), calls);
}

#[tokio::test]
async fn query_embedding_failure_is_an_error() {
    let (engine, _, _) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;

    let result = engine.query("FAIL apple", None, 5, 0.0).await;
    assert!(matches!(result, Err(RagError::EmbeddingError { .. })));
}

#[tokio::test]
async fn query_with_wrong_dimension_is_rejected() {
    let (engine, _, _) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;

    let result = engine.query("WIDE apple", None, 5, 0.0).await;
    assert!(matches!(result, Err(RagError::DimensionMismatch { expected: 4, actual: 5 })));
}

#[tokio::test]
async fn similarity_threshold_is_inclusive() {
    let (engine, _, _) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;

    // [1,0,0,0] vs [0,1,0,0]: squared distance 2, similarity 1/3.
    let exact = engine.query("banana", None, 5, 1.0_f32 / 3.0_f32).await.unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].similarity, 1.0_f32 / 3.0_f32);

    let above = engine.query("banana", None, 5, 0.34).await.unwrap();
    assert!(above.is_empty());
}

#[tokio::test]
async fn results_are_ordered_and_bounded() {
    let (engine, _, _) = memory_engine();
    for text in ["apple banana", "cherry", "apple", "date date", "banana", "apple apple cherry"] {
        ingest_one(&engine, text, "mix.txt", None).await;
    }

    let hits = engine.query("apple banana", None, 10, 0.0).await.unwrap();
    assert_eq!(hits.len(), 6);
    assert_eq!(hits[0].document.content, "apple banana");
    assert_eq!(hits[0].similarity, 1.0);
    for pair in hits.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }

    let top = engine.query("apple banana", None, 3, 0.0).await.unwrap();
    assert_eq!(top.len(), 3);
    assert_eq!(top[0].document.id, hits[0].document.id);
}

#[tokio::test]
async fn search_uses_configured_defaults() {
    let embedder = Arc::new(KeywordEmbedder::new());
    let config = RetrievalConfig::builder().top_k(2).similarity_threshold(0.2).build().unwrap();
    let engine = engine_with(config, embedder, Arc::new(InMemoryRecordStore::new()));
    for text in ["apple", "apple", "apple", "date date date"] {
        ingest_one(&engine, text, "a.txt", None).await;
    }

    let hits = engine.search("apple", None).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|hit| hit.document.content == "apple"));
}

#[tokio::test]
async fn deleting_a_partition_empties_its_scope() {
    let (engine, _, records) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", Some("chat-1")).await;
    ingest_one(&engine, "banana", "b.txt", Some("chat-1")).await;
    ingest_one(&engine, "apple", "c.txt", Some("chat-2")).await;

    assert_eq!(engine.delete_by_partition("chat-1").await.unwrap(), 2);
    assert_eq!(engine.delete_by_partition("chat-1").await.unwrap(), 0);

    assert!(engine.query("apple", Some("chat-1"), 5, 0.0).await.unwrap().is_empty());
    assert_eq!(engine.statistics(Some("chat-1")).await.document_count, 0);
    assert_eq!(engine.statistics(None).await.document_count, 1);
    assert_eq!(records.len(), 1);

    let survivors = engine.query("apple", None, 5, 0.0).await.unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].document.source, "c.txt");
}

#[tokio::test]
async fn delete_by_source_and_single_document() {
    let (engine, _, records) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;
    ingest_one(&engine, "banana", "b.txt", Some("p")).await;
    ingest_one(&engine, "cherry", "b.txt", None).await;

    assert_eq!(engine.delete_by_source("b.txt").await.unwrap(), 2);
    assert_eq!(engine.delete_by_source("b.txt").await.unwrap(), 0);
    assert_eq!(records.len(), 1);

    let remaining = engine.list_documents(None).await;
    assert_eq!(remaining.len(), 1);
    let id = remaining[0].id.clone();

    assert!(engine.delete_document(&id).await.unwrap());
    assert!(!engine.delete_document(&id).await.unwrap());
    assert!(engine.is_empty().await);
    assert!(records.is_empty());
    assert!(engine.get_document(&id).await.is_none());

    // The dimension outlives the last document.
    assert_eq!(engine.dimension().await, Some(4));
    let result = engine.ingest(&["WIDE"], "w.txt", None, &Metadata::new()).await;
    assert!(matches!(result, Err(RagError::DimensionMismatch { .. })));
}

#[tokio::test]
async fn failed_chunk_embedding_yields_partial_report() {
    let (engine, _, _) = memory_engine();
    let chunks = ["apple", "FAIL", "banana"];
    let report = engine.ingest(&chunks, "x.txt", Some("c"), &Metadata::new()).await.unwrap();

    assert_eq!(report.requested, 3);
    assert_eq!(report.added, 2);
    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].chunk_index, 1);
    assert_eq!(report.document_ids.len(), 2);

    let last = engine.get_document(&report.document_ids[1]).await.unwrap();
    assert_eq!(last.content, "banana");
    assert_eq!(last.metadata["chunk_index"], json!(2));
    assert_eq!(last.metadata["chunk_total"], json!(3));
    assert_eq!(engine.len().await, 2);
}

#[tokio::test]
async fn dimension_change_aborts_ingestion() {
    let (engine, _, _) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;

    let result = engine.ingest(&["banana", "WIDE"], "b.txt", None, &Metadata::new()).await;
    assert!(matches!(result, Err(RagError::DimensionMismatch { expected: 4, actual: 5 })));

    // Chunks ahead of the mismatch stay added and searchable.
    assert_eq!(engine.len().await, 2);
    assert_eq!(engine.query("banana", None, 1, 0.9).await.unwrap().len(), 1);
}

#[tokio::test]
async fn persistence_failure_rolls_the_chunk_back() {
    let embedder = Arc::new(KeywordEmbedder::new());
    let records = Arc::new(RejectingRecordStore::failing_writes("cherry"));
    let engine = engine_with(open_config(), embedder, records.clone());

    let report =
        engine.ingest(&["apple", "cherry"], "a.txt", None, &Metadata::new()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.failures[0].chunk_index, 1);
    assert!(report.failures[0].reason.contains("disk full"));

    assert_eq!(engine.len().await, 1);
    assert_eq!(records.inner.len(), 1);
    let hits = engine.query("cherry", None, 10, 0.0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document.content, "apple");
}

#[tokio::test]
async fn non_finite_embeddings_are_rejected() {
    let (engine, _, records) = memory_engine();

    let report = engine.ingest(&["apple", "NAN"], "a.txt", None, &Metadata::new()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].chunk_index, 1);
    assert_eq!(records.len(), 1);

    let err = engine.query("NAN apple", None, 5, 0.0).await.unwrap_err();
    assert!(matches!(err, RagError::EmbeddingError { .. }), "got {err:?}");
    assert_eq!(engine.query("apple", None, 5, 0.9).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_erase_keeps_the_document_live_in_place() {
    let embedder = Arc::new(KeywordEmbedder::new());
    let records = Arc::new(RejectingRecordStore::failing_erases("cherry"));
    let engine = engine_with(open_config(), embedder, records.clone());
    ingest_one(&engine, "apple", "a.txt", Some("A")).await;
    ingest_one(&engine, "cherry", "c.txt", Some("A")).await;
    ingest_one(&engine, "date", "d.txt", Some("B")).await;
    ingest_one(&engine, "banana", "b.txt", Some("A")).await;
    let listed = engine.list_documents(None).await;
    let (cherry_id, date_id) = (listed[1].id.clone(), listed[2].id.clone());

    let err = engine.delete_by_partition("A").await.unwrap_err();
    assert!(matches!(err, RagError::PersistenceError { .. }), "got {err:?}");

    let remaining: Vec<String> =
        engine.list_documents(None).await.into_iter().map(|s| s.id).collect();
    assert_eq!(remaining, vec![cherry_id.clone(), date_id.clone()]);
    assert!(records.inner.get(&cherry_id).is_some());
    assert_eq!(records.inner.len(), 2);

    // The rebuilt index still lines up with the surviving documents.
    let hits = engine.query("cherry", Some("A"), 5, 0.9).await.unwrap();
    assert_eq!(ids(&hits), vec![cherry_id.clone()]);
    let hits = engine.query("date", None, 1, 0.9).await.unwrap();
    assert_eq!(ids(&hits), vec![date_id]);

    assert!(engine.delete_document(&cherry_id).await.is_err());
    assert!(engine.get_document(&cherry_id).await.is_some());
}

#[tokio::test]
async fn query_rejects_thresholds_outside_the_unit_range() {
    let (engine, _, _) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;

    for threshold in [f32::NAN, 1.5, -0.1] {
        let err = engine.query("apple", None, 5, threshold).await.unwrap_err();
        assert!(matches!(err, RagError::ConfigError(_)), "{threshold}: got {err:?}");
    }
    assert_eq!(engine.query("apple", None, 5, 1.0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reload_reembeds_records_stored_without_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let config = RetrievalConfig::builder()
        .similarity_threshold(0.0)
        .persist_embeddings(false)
        .build()
        .unwrap();

    let first = engine_with(
        config.clone(),
        Arc::new(KeywordEmbedder::new()),
        Arc::new(JsonRecordStore::open(dir.path()).unwrap()),
    );
    for text in ["apple banana", "cherry", "date date"] {
        ingest_one(&first, text, "notes.txt", Some("c1")).await;
    }
    let before = first.query("apple", Some("c1"), 10, 0.0).await.unwrap();

    let records = JsonRecordStore::open(dir.path()).unwrap();
    let on_disk = records.load_all().unwrap();
    assert_eq!(on_disk.records.len(), 3);
    assert!(on_disk.records.iter().all(|record| record.embedding.is_none()));

    let embedder = Arc::new(KeywordEmbedder::new());
    let second = engine_with(config, embedder.clone(), Arc::new(records));
    assert_eq!(second.load_from_disk().await.unwrap(), 3);
    assert_eq!(embedder.calls(), 3);

    for hit in &before {
        let reloaded = second.get_document(&hit.document.id).await.unwrap();
        assert_eq!(reloaded.embedding, hit.document.embedding);
        assert_eq!(reloaded.content, hit.document.content);
        assert_eq!(reloaded.partition_key.as_deref(), Some("c1"));
    }

    let after = second.query("apple", Some("c1"), 10, 0.0).await.unwrap();
    assert_eq!(ids(&before), ids(&after));
}

#[tokio::test]
async fn reload_with_stored_vectors_skips_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine_with(
        open_config(),
        Arc::new(KeywordEmbedder::new()),
        Arc::new(JsonRecordStore::open(dir.path()).unwrap()),
    );
    ingest_one(&first, "apple", "a.md", Some("c1")).await;
    ingest_one(&first, "banana", "b.md", None).await;

    let embedder = Arc::new(KeywordEmbedder::new());
    let second = engine_with(
        open_config(),
        embedder.clone(),
        Arc::new(JsonRecordStore::open(dir.path()).unwrap()),
    );
    assert_eq!(second.load_from_disk().await.unwrap(), 2);
    assert_eq!(embedder.calls(), 0);
    assert_eq!(second.dimension().await, Some(4));
    assert_eq!(second.statistics(Some("c1")).await.document_count, 1);
}

#[tokio::test]
async fn malformed_records_are_skipped_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let records = JsonRecordStore::open(dir.path()).unwrap();
    let first =
        engine_with(open_config(), Arc::new(KeywordEmbedder::new()), Arc::new(records.clone()));
    ingest_one(&first, "apple", "a.txt", None).await;
    std::fs::write(records.dir().join("broken.json"), b"{ not json").unwrap();
    std::fs::write(records.dir().join("notes.txt"), b"ignored").unwrap();

    let events = CapturedEvents::new();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(events.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let second = engine_with(open_config(), Arc::new(KeywordEmbedder::new()), Arc::new(records));
    assert_eq!(second.load_from_disk().await.unwrap(), 1);

    let warnings = events.at_level(Level::WARN);
    assert!(!warnings.is_empty());
    assert!(events.contains_message("skipping unreadable document record"));
    let mentions_file = |event: &chatdoc_telemetry::CapturedEvent| {
        event.fields.get("record").is_some_and(|v| v.to_string().contains("broken.json"))
    };
    assert!(warnings.iter().any(mentions_file));
}

#[tokio::test]
async fn failed_reload_keeps_previous_state() {
    let (engine, _, records) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;

    let stray = Document::new("odd", "odd.txt", None, Metadata::new())
        .with_embedding(vec![1.0, 2.0]);
    records.write(&DocumentRecord::from_document(&stray, true)).unwrap();

    let result = engine.load_from_disk().await;
    assert!(matches!(result, Err(RagError::DimensionMismatch { expected: 4, actual: 2 })));
    assert_eq!(engine.len().await, 1);
    assert_eq!(engine.query("apple", None, 5, 0.9).await.unwrap().len(), 1);
}

#[tokio::test]
async fn adaptive_overfetch_reaches_sparse_partitions() {
    async fn run(adaptive: bool) -> usize {
        let config = RetrievalConfig::builder()
            .similarity_threshold(0.0)
            .overfetch_factor(2)
            .adaptive_overfetch(adaptive)
            .build()
            .unwrap();
        let records = Arc::new(InMemoryRecordStore::new());
        let engine = engine_with(config, Arc::new(KeywordEmbedder::new()), records);
        for _ in 0..3 {
            ingest_one(&engine, "apple", "crowd.txt", Some("B")).await;
        }
        ingest_one(&engine, "apple banana", "sparse.txt", Some("A")).await;
        engine.query("apple", Some("A"), 1, 0.0).await.unwrap().len()
    }

    // The fixed window (1 * 2) only sees partition B's exact matches.
    assert_eq!(run(false).await, 0);
    assert_eq!(run(true).await, 1);
}

#[tokio::test]
async fn ingest_text_records_chunk_metadata() {
    let embedder = Arc::new(KeywordEmbedder::new());
    let config = RetrievalConfig::builder()
        .chunk_size(15)
        .chunk_overlap(0)
        .similarity_threshold(0.0)
        .build()
        .unwrap();
    let engine = engine_with(config, embedder, Arc::new(InMemoryRecordStore::new()));

    let text = "Apple pie.  Banana\nbread.";
    let report = engine.ingest_text(text, "Notes.MD", Some("c1"), None).await.unwrap();
    assert_eq!(report.added, 2);

    let first = engine.get_document(&report.document_ids[0]).await.unwrap();
    let second = engine.get_document(&report.document_ids[1]).await.unwrap();
    assert_eq!(first.content, "Apple pie.");
    assert_eq!(second.content, "Banana bread.");
    assert_eq!(first.metadata["file_type"], json!("md"));
    assert_eq!(first.metadata["chunk_index"], json!(0));
    assert_eq!(second.metadata["chunk_index"], json!(1));
    assert_eq!(second.metadata["chunk_total"], json!(2));
    assert_eq!(second.metadata["chunk_count"], json!(2));
    assert_eq!(second.metadata["chunk_size"], json!(15));
    assert_eq!(second.metadata["overlap"], json!(0));
    assert_eq!(second.metadata["original_size"], json!(text.chars().count()));

    engine.ingest_text("Cherry.", "upload-123", Some("c1"), Some(".PDF")).await.unwrap();
    engine.ingest_text("Date.", "README", Some("c1"), None).await.unwrap();

    let stats = engine.statistics(Some("c1")).await;
    assert_eq!(stats.document_count, 4);
    assert_eq!(stats.file_types["md"], 2);
    assert_eq!(stats.file_types["pdf"], 1);
    assert_eq!(stats.file_types["unknown"], 1);
    assert_eq!(engine.statistics(Some("other")).await.document_count, 0);

    let blank = engine.ingest_text(" \n ", "empty.txt", None, None).await;
    assert!(matches!(blank, Err(RagError::ChunkingError(_))));
}

#[tokio::test]
async fn flush_rewrites_every_record() {
    let (engine, _, records) = memory_engine();
    ingest_one(&engine, "apple", "a.txt", None).await;
    ingest_one(&engine, "banana", "b.txt", None).await;

    for summary in engine.list_documents(None).await {
        records.erase(&summary.id).unwrap();
    }
    assert!(records.is_empty());

    assert_eq!(engine.flush().await.unwrap(), 2);
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn builder_requires_provider_and_records() {
    let missing_provider =
        RetrievalEngine::builder().record_store(Arc::new(InMemoryRecordStore::new())).build();
    assert!(matches!(missing_provider, Err(RagError::ConfigError(_))));

    let missing_records =
        RetrievalEngine::builder().embedding_provider(Arc::new(KeywordEmbedder::new())).build();
    assert!(matches!(missing_records, Err(RagError::ConfigError(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingest_and_query_stay_consistent() {
    let (engine, _, records) = memory_engine();
    let engine = Arc::new(engine);
    ingest_one(&engine, "apple", "seed.txt", None).await;

    let mut handles = Vec::new();
    for worker in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let partition = format!("chat-{}", worker % 2);
            for _ in 0..5 {
                let scope = Some(partition.as_str());
                let metadata = Metadata::new();
                engine.ingest(&["apple banana"], "load.txt", scope, &metadata).await.unwrap();
                engine.query("apple", scope, 3, 0.0).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(engine.len().await, 41);
    assert_eq!(records.len(), 41);
    assert_eq!(engine.statistics(Some("chat-0")).await.document_count, 20);
}
