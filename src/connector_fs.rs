//! Filesystem bulk-synchronization job.
//!
//! Walks `[connectors.filesystem].root`, applying include and exclude globs,
//! and feeds every matching file through the bulk-sync contract of the
//! [`Ingestor`]. A file may carry a JSON companion next to it named
//! `<file>.meta.json` holding any subset of the metadata fields.
//!
//! Document ids default to a UUIDv5 of `source:relative_path`, so a re-sync
//! overwrites the same Raw record instead of creating a new one. A file
//! whose content and companion have not changed since the last sync is
//! left alone, along with everything derived from it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::FilesystemConnectorConfig;
use crate::ingest::{IngestOptions, IngestReceipt, Ingestor};
use crate::models::PartialMetadata;
use crate::progress::{ProgressEvent, SharedProgress};

const COMPANION_SUFFIX: &str = ".meta.json";
const STAGE: &str = "sync";

/// One file found by the scan.
#[derive(Debug, Clone)]
pub struct ScannedDocument {
    pub path: PathBuf,
    /// Path relative to the connector root, `/`-separated.
    pub relative_path: String,
    pub content: Vec<u8>,
    /// Raw companion text, if a companion file exists.
    pub companion: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub written: usize,
    /// Identical to the current Raw revision; nothing was written.
    pub unchanged: usize,
    /// Written without a companion or hint; defaults are applied downstream.
    pub unlabeled: usize,
    /// `(relative_path, reason)` of every file that was not written.
    pub rejected: Vec<(String, String)>,
}

pub fn scan_filesystem(config: &FilesystemConnectorConfig) -> Result<Vec<ScannedDocument>> {
    let root = &config.root;
    if !root.exists() {
        bail!(
            "Filesystem connector root does not exist: {}",
            root.display()
        );
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
        format!("**/*{}", COMPANION_SUFFIX),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs = Vec::new();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let content =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let companion = read_companion(path)?;
        docs.push(ScannedDocument {
            path: path.to_path_buf(),
            relative_path: rel_str,
            content,
            companion,
        });
    }

    docs.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(docs)
}

/// Stable id for a synced file.
pub fn derive_doc_id(source: &str, relative_path: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{}:{}", source, relative_path).as_bytes(),
    )
    .to_string()
}

/// Scan the root and write every document to the Raw tier.
///
/// Per-file failures (a malformed companion, an invalid classification, a
/// refused downgrade, a store error) are collected in the report; they
/// never stop the rest of the sync.
pub async fn run_sync(
    ingestor: &Ingestor,
    config: &FilesystemConnectorConfig,
    options: IngestOptions,
    progress: &SharedProgress,
) -> Result<SyncReport> {
    progress.report(ProgressEvent::Discovering {
        stage: STAGE.to_string(),
    });
    let docs = scan_filesystem(config)?;
    let total = docs.len() as u64;
    let mut report = SyncReport {
        scanned: docs.len(),
        ..Default::default()
    };

    for (n, doc) in docs.iter().enumerate() {
        match sync_one(ingestor, config, doc, options).await {
            Ok(receipt) if receipt.unchanged => report.unchanged += 1,
            Ok(receipt) => {
                report.written += 1;
                if receipt.metadata.is_none() {
                    report.unlabeled += 1;
                }
            }
            Err(reason) => {
                warn!(path = %doc.relative_path, %reason, "document not synced");
                report.rejected.push((doc.relative_path.clone(), reason));
            }
        }
        progress.report(ProgressEvent::Processing {
            stage: STAGE.to_string(),
            n: n as u64 + 1,
            total,
        });
    }

    progress.report(ProgressEvent::Finished {
        stage: STAGE.to_string(),
        advanced: report.written as u64,
        failed: report.rejected.len() as u64,
        timed_out: false,
    });
    info!(
        root = %config.root.display(),
        scanned = report.scanned,
        written = report.written,
        unchanged = report.unchanged,
        rejected = report.rejected.len(),
        "filesystem sync finished"
    );
    Ok(report)
}

async fn sync_one(
    ingestor: &Ingestor,
    config: &FilesystemConnectorConfig,
    doc: &ScannedDocument,
    options: IngestOptions,
) -> std::result::Result<IngestReceipt, String> {
    let default_id = derive_doc_id(&config.source, &doc.relative_path);

    if doc.companion.is_none() && config.classification_hint.is_none() {
        return ingestor
            .ingest_unlabeled(&default_id, &doc.content, options)
            .await
            .map_err(|e| e.to_string());
    }

    let mut attrs = match &doc.companion {
        Some(json) => PartialMetadata::from_json(json).map_err(|e| e.to_string())?,
        None => PartialMetadata::default(),
    };
    attrs.doc_id.get_or_insert(default_id);
    attrs.source.get_or_insert_with(|| config.source.clone());
    attrs.title.get_or_insert_with(|| doc.relative_path.clone());

    ingestor
        .ingest_synced(
            Some(doc.content.as_slice()),
            &attrs,
            config.classification_hint.as_deref(),
            options,
        )
        .await
        .map_err(|e| e.to_string())
}

fn read_companion(path: &Path) -> Result<Option<String>> {
    let mut name = path.as_os_str().to_owned();
    name.push(COMPANION_SUFFIX);
    let companion = PathBuf::from(name);
    if !companion.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&companion)
        .with_context(|| format!("Failed to read {}", companion.display()))?;
    Ok(Some(text))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::Synthesizer;
    use crate::models::{ConfidentialityLevel, Tier};
    use crate::pipeline::Pipeline;
    use crate::progress::silent;
    use crate::store::memory::InMemoryStore;
    use crate::store::Store;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fs_config(root: &Path) -> FilesystemConnectorConfig {
        FilesystemConnectorConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".to_string(), "**/*.txt".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            source: "handbook".to_string(),
            classification_hint: None,
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn scan_applies_globs_and_pairs_companions() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        write(tmp.path(), "a.md.meta.json", r#"{"confidentiality_level":"internal"}"#);
        write(tmp.path(), "nested/b.txt", "beta");
        write(tmp.path(), "image.png", "binary");
        write(tmp.path(), ".git/config.md", "ignored");

        let docs = scan_filesystem(&fs_config(tmp.path())).unwrap();
        let paths: Vec<&str> = docs.iter().map(|d| d.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "nested/b.txt"]);
        assert!(docs[0].companion.is_some());
        assert!(docs[1].companion.is_none());
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_filesystem(&fs_config(&tmp.path().join("nope"))).is_err());
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derive_doc_id("s", "a.md"), derive_doc_id("s", "a.md"));
        assert_ne!(derive_doc_id("s", "a.md"), derive_doc_id("t", "a.md"));
    }

    #[tokio::test]
    async fn sync_writes_labeled_and_unlabeled_documents() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "plan.md", "roadmap");
        write(
            tmp.path(),
            "plan.md.meta.json",
            r#"{"confidentiality_level":"confidential","tags":["strategy"]}"#,
        );
        write(tmp.path(), "notes.txt", "misc");
        write(tmp.path(), "bad.md", "x");
        write(tmp.path(), "bad.md.meta.json", r#"{"confidentiality_level":"secret"}"#);

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), Synthesizer::default());
        let config = fs_config(tmp.path());
        let report = run_sync(&ingestor, &config, IngestOptions::default(), &silent())
            .await
            .unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.written, 2);
        assert_eq!(report.unlabeled, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "bad.md");

        let plan = store
            .get(Tier::Raw, &derive_doc_id("handbook", "plan.md"))
            .await
            .unwrap();
        let meta = plan.primary().1.unwrap();
        assert_eq!(meta.confidentiality_level, ConfidentialityLevel::Confidential);
        assert_eq!(meta.source, "handbook");
        assert_eq!(meta.title.as_deref(), Some("plan.md"));

        let notes = store
            .get(Tier::Raw, &derive_doc_id("handbook", "notes.txt"))
            .await
            .unwrap();
        assert!(notes.primary().1.is_none());

        // Re-sync overwrites rather than duplicating.
        write(tmp.path(), "notes.txt", "misc, revised");
        let report = run_sync(&ingestor, &config, IngestOptions::default(), &silent())
            .await
            .unwrap();
        assert_eq!((report.written, report.unchanged), (1, 1));
        assert_eq!(store.count(Tier::Raw).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unchanged_resync_leaves_nothing_pending() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha release notes");
        write(tmp.path(), "a.md.meta.json", r#"{"confidentiality_level":"internal"}"#);
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), Synthesizer::default());
        let pipeline = Pipeline::from_config(&Config::minimal(), store.clone()).unwrap();
        let config = fs_config(tmp.path());

        run_sync(&ingestor, &config, IngestOptions::default(), &silent())
            .await
            .unwrap();
        pipeline.run_all().await.unwrap();
        let doc_id = derive_doc_id("handbook", "a.md");
        let uploaded_at = store.get(Tier::Raw, &doc_id).await.unwrap().primary().1.unwrap().uploaded_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let report = run_sync(&ingestor, &config, IngestOptions::default(), &silent())
            .await
            .unwrap();
        assert_eq!((report.written, report.unchanged), (0, 1));

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.pending_enrich + status.pending_index, 0);
        let raw = store.get(Tier::Raw, &doc_id).await.unwrap();
        assert_eq!(raw.primary().1.unwrap().uploaded_at, uploaded_at);
        assert!(store.get(Tier::Indexed, &doc_id).await.is_ok());
    }

    #[tokio::test]
    async fn connector_hint_labels_every_document() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "alpha");
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), Synthesizer::default());
        let mut config = fs_config(tmp.path());
        config.classification_hint = Some("internal".to_string());

        let report = run_sync(&ingestor, &config, IngestOptions::default(), &silent())
            .await
            .unwrap();
        assert_eq!(report.unlabeled, 0);
        let doc = store
            .get(Tier::Raw, &derive_doc_id("handbook", "a.md"))
            .await
            .unwrap();
        assert_eq!(
            doc.primary().1.unwrap().confidentiality_level,
            ConfidentialityLevel::Internal
        );
    }
}
