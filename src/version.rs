//! Content-hash based document versioning.
//!
//! Every `(kb, source_type, source_path)` maps to one [`Document`] row whose
//! `current_version` only ever grows. [`VersionTracker::should_reingest`]
//! compares a new content hash with the stored one and decides:
//!
//! | Stored state | Decision |
//! |--------------|----------|
//! | no row | proceed, version 1 |
//! | same hash, version completed | skip |
//! | same hash, version never completed | proceed at the same version (repair) |
//! | different hash | proceed, version + 1 |
//!
//! A version counts as completed once its whole chunk set has been written
//! (see [`VersionTracker::mark_complete`]).

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::error::Result;
use crate::models::{Document, DocumentClass, DocumentId, DocumentVersion, KbId};

/// Outcome of a version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub proceed: bool,
    pub next_version: i64,
    pub document_id: Option<DocumentId>,
    /// Re-chunking an interrupted version without bumping it.
    pub repair: bool,
}

/// Classification data recorded alongside a version bump.
#[derive(Debug, Clone)]
pub struct DocumentTraits {
    pub document_class: DocumentClass,
    pub language: String,
}

impl DocumentTraits {
    pub fn detect(source_type: &str, source_path: &str, text: &str) -> Self {
        Self {
            document_class: document_class(source_type, source_path, text),
            language: detect_language(text).to_string(),
        }
    }
}

#[derive(Clone)]
pub struct VersionTracker {
    pool: SqlitePool,
}

impl VersionTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read-only version check. Never writes.
    pub async fn peek(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        new_hash: &str,
    ) -> Result<Decision> {
        let existing = self.find(kb_id, source_type, source_path).await?;
        let Some(doc) = existing else {
            return Ok(Decision {
                proceed: true,
                next_version: 1,
                document_id: None,
                repair: false,
            });
        };

        if doc.content_hash != new_hash {
            return Ok(Decision {
                proceed: true,
                next_version: doc.current_version + 1,
                document_id: Some(doc.id),
                repair: false,
            });
        }

        let completed = self.is_complete(doc.id, doc.current_version).await?;
        Ok(Decision {
            proceed: !completed,
            next_version: doc.current_version,
            document_id: Some(doc.id),
            repair: !completed,
        })
    }

    /// Check the hash and, when ingestion should proceed, record the new
    /// version in one transaction.
    pub async fn should_reingest(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
        new_hash: &str,
        traits: &DocumentTraits,
    ) -> Result<Decision> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, content_hash, current_version FROM documents \
             WHERE kb_id = ? AND source_type = ? AND source_path = ?",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(source_path)
        .fetch_optional(&mut *tx)
        .await?;

        let decision = match row {
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO documents (kb_id, source_type, source_path, content_hash,
                        document_class, language, current_version, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                    "#,
                )
                .bind(kb_id)
                .bind(source_type)
                .bind(source_path)
                .bind(new_hash)
                .bind(traits.document_class.as_str())
                .bind(&traits.language)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                let document_id = result.last_insert_rowid();
                insert_version(&mut tx, document_id, 1, new_hash, now).await?;
                Decision {
                    proceed: true,
                    next_version: 1,
                    document_id: Some(document_id),
                    repair: false,
                }
            }
            Some(row) => {
                let document_id: i64 = row.get("id");
                let stored_hash: String = row.get("content_hash");
                let current: i64 = row.get("current_version");

                if stored_hash == new_hash {
                    let completed: Option<Option<i64>> = sqlx::query_scalar(
                        "SELECT completed_at FROM document_versions WHERE document_id = ? AND version = ?",
                    )
                    .bind(document_id)
                    .bind(current)
                    .fetch_optional(&mut *tx)
                    .await?;
                    let is_complete = matches!(completed, Some(Some(_)));
                    Decision {
                        proceed: !is_complete,
                        next_version: current,
                        document_id: Some(document_id),
                        repair: !is_complete,
                    }
                } else {
                    let next = current + 1;
                    sqlx::query(
                        r#"
                        UPDATE documents SET content_hash = ?, document_class = ?, language = ?,
                            current_version = ?, updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_hash)
                    .bind(traits.document_class.as_str())
                    .bind(&traits.language)
                    .bind(next)
                    .bind(now)
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await?;
                    insert_version(&mut tx, document_id, next, new_hash, now).await?;
                    Decision {
                        proceed: true,
                        next_version: next,
                        document_id: Some(document_id),
                        repair: false,
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(decision)
    }

    /// Record that the chunk set for `version` is fully written.
    pub async fn mark_complete(&self, document_id: DocumentId, version: i64) -> Result<()> {
        sqlx::query(
            "UPDATE document_versions SET completed_at = ? \
             WHERE document_id = ? AND version = ? AND completed_at IS NULL",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(document_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE kb_id = ? AND source_type = ? AND source_path = ?",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(source_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| document_from_row(&r)))
    }

    pub async fn versions(&self, document_id: DocumentId) -> Result<Vec<DocumentVersion>> {
        let rows = sqlx::query(
            "SELECT * FROM document_versions WHERE document_id = ? ORDER BY version ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| DocumentVersion {
                id: r.get("id"),
                document_id: r.get("document_id"),
                version: r.get("version"),
                content_hash: r.get("content_hash"),
                created_at: r.get("created_at"),
                completed_at: r.get("completed_at"),
            })
            .collect())
    }

    /// Documents in `kb_id` whose current version never completed.
    pub async fn incomplete(&self, kb_id: KbId) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT d.source_path, d.current_version
            FROM documents d
            JOIN document_versions v
              ON v.document_id = d.id AND v.version = d.current_version
            WHERE d.kb_id = ? AND v.completed_at IS NULL
            ORDER BY d.source_path
            "#,
        )
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("source_path"), r.get("current_version")))
            .collect())
    }

    async fn is_complete(&self, document_id: DocumentId, version: i64) -> Result<bool> {
        let completed: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT completed_at FROM document_versions WHERE document_id = ? AND version = ?",
        )
        .bind(document_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(completed, Some(Some(_))))
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: DocumentId,
    version: i64,
    hash: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO document_versions (document_id, version, content_hash, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(document_id)
    .bind(version)
    .bind(hash)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Document {
    let class: String = row.get("document_class");
    Document {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        source_type: row.get("source_type"),
        source_path: row.get("source_path"),
        content_hash: row.get("content_hash"),
        document_class: DocumentClass::parse(&class),
        language: row.get("language"),
        current_version: row.get("current_version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Hex SHA-256 of the raw source bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `ru` when Cyrillic letters outnumber Latin ones, `en` when any Latin
/// letter is present, `ru` otherwise.
pub fn detect_language(text: &str) -> &'static str {
    let mut cyrillic = 0usize;
    let mut latin = 0usize;
    for ch in text.chars() {
        if ch.is_ascii_alphabetic() {
            latin += 1;
        } else if matches!(ch, 'а'..='я' | 'А'..='Я' | 'ё' | 'Ё') {
            cyrillic += 1;
        }
    }
    if cyrillic > latin {
        "ru"
    } else if latin > 0 {
        "en"
    } else {
        "ru"
    }
}

const SAMPLE_CHARS: usize = 2000;

/// Classify a document by source type, extension, then content sample.
pub fn document_class(source_type: &str, source_path: &str, text: &str) -> DocumentClass {
    match source_type.to_ascii_lowercase().as_str() {
        "code" => return DocumentClass::Code,
        "markdown" | "wiki" => return DocumentClass::Markdown,
        _ => {}
    }

    let ext = Path::new(source_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => return DocumentClass::Markdown,
        "py" | "js" | "ts" | "java" | "go" | "rs" | "cpp" | "c" | "cs" | "sh" => {
            return DocumentClass::Code
        }
        "json" | "yaml" | "yml" | "toml" | "ini" | "env" => return DocumentClass::Config,
        "csv" | "tsv" | "xlsx" | "xls" => return DocumentClass::Table,
        "log" => return DocumentClass::Log,
        _ => {}
    }

    let sample: String = text.chars().take(SAMPLE_CHARS).collect::<String>().to_lowercase();
    if sample.contains("```") || sample.contains("class ") || sample.contains("def ") {
        DocumentClass::Code
    } else if sample.contains("\n# ") || sample.contains("\n## ") {
        DocumentClass::Markdown
    } else if sample.contains('{') && sample.contains('}') && sample.contains(':') {
        DocumentClass::Config
    } else if sample.contains(',') && sample.contains('\n') {
        DocumentClass::Table
    } else {
        DocumentClass::Text
    }
}
