//! SQLite persistence for knowledge bases and chunks.
//!
//! Every public method here is a single statement or a single transaction.
//! Batching and lock retries are the caller's business (see
//! [`crate::writer`]), which keeps each transaction short and lets a retry
//! repeat exactly one unit of work.
//!
//! Chunks are written in two phases:
//!
//! ```text
//! insert_rows      ── rows with embedding = NULL ──▶ ids
//! fill_embeddings  ── UPDATE embedding WHERE id = ? ─▶ dense-searchable
//! ```
//!
//! A chunk whose embedding is still NULL is ignored by [`ChunkStore::load_for_index`]
//! but returned by [`ChunkStore::load_for_keyword`].

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;

use crate::config::ChunkingConfig;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{KbError, Result};
use crate::models::{
    ChunkContext, ChunkDraft, ChunkId, ChunkMetadata, ChunkRecord, DocumentId, KbId, KbSettings,
    KbStats, KnowledgeBase,
};

/// A chunk with its stored vector, as loaded for an index build.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub vector: Vec<f32>,
    pub record: Arc<ChunkRecord>,
}

#[derive(Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
    chunking: ChunkingConfig,
}

impl ChunkStore {
    pub fn new(pool: SqlitePool, chunking: ChunkingConfig) -> Self {
        Self { pool, chunking }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Knowledge bases ============

    pub async fn create_kb(
        &self,
        name: &str,
        description: Option<&str>,
        settings: &KbSettings,
    ) -> Result<KnowledgeBase> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KbError::InvalidInput("knowledge base name is empty".into()));
        }
        if self.get_kb_by_name(name).await?.is_some() {
            return Err(KbError::AlreadyExists(format!("knowledge base '{}'", name)));
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO knowledge_bases (name, description, settings_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(settings.to_json()?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(KbError::AlreadyExists(format!("knowledge base '{}'", name)));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(KnowledgeBase {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            description: description.map(str::to_string),
            settings: settings.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_kb(&self, kb_id: KbId) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| self.kb_from_row(&r)))
    }

    pub async fn get_kb_by_name(&self, name: &str) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| self.kb_from_row(&r)))
    }

    pub async fn list_kbs(&self) -> Result<Vec<KnowledgeBase>> {
        let rows = sqlx::query("SELECT * FROM knowledge_bases ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| self.kb_from_row(r)).collect())
    }

    /// Merge a partial settings object into the stored settings.
    pub async fn update_kb_settings(
        &self,
        kb_id: KbId,
        patch: &serde_json::Value,
    ) -> Result<KnowledgeBase> {
        let mut kb = self
            .get_kb(kb_id)
            .await?
            .ok_or_else(|| KbError::NotFound(format!("knowledge base {}", kb_id)))?;
        kb.settings.merge(patch);
        kb.updated_at = chrono::Utc::now().timestamp();

        sqlx::query("UPDATE knowledge_bases SET settings_json = ?, updated_at = ? WHERE id = ?")
            .bind(kb.settings.to_json()?)
            .bind(kb.updated_at)
            .bind(kb_id)
            .execute(&self.pool)
            .await?;
        Ok(kb)
    }

    /// Remove every chunk, version and document of a knowledge base, keeping
    /// the knowledge base itself. Returns `(chunks, documents)` removed.
    pub async fn clear_kb(&self, kb_id: KbId) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let chunks = sqlx::query("DELETE FROM chunks WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        // document_versions cascade from documents
        let documents = sqlx::query("DELETE FROM documents WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok((chunks, documents))
    }

    /// Delete a knowledge base and, by cascade, everything in it.
    pub async fn delete_kb(&self, kb_id: KbId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    fn kb_from_row(&self, row: &SqliteRow) -> KnowledgeBase {
        let raw: String = row.get("settings_json");
        KnowledgeBase {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            settings: KbSettings::from_json(&raw, &self.chunking),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    // ============ Chunk writes ============

    /// Phase 1: insert chunk rows without embeddings, in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_rows(
        &self,
        kb_id: KbId,
        document_id: DocumentId,
        source_type: &str,
        source_path: &str,
        doc_version: i64,
        drafts: &[ChunkDraft],
    ) -> Result<Vec<ChunkId>> {
        let now = chrono::Utc::now().timestamp();
        let mut ids = Vec::with_capacity(drafts.len());
        let mut tx = self.pool.begin().await?;

        for draft in drafts {
            let metadata_json = serde_json::to_string(&draft.metadata)?;
            let result = sqlx::query(
                r#"
                INSERT INTO chunks (kb_id, document_id, source_type, source_path, doc_version,
                    chunk_no, content, metadata_json, embedding, embedding_dims, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?)
                "#,
            )
            .bind(kb_id)
            .bind(document_id)
            .bind(source_type)
            .bind(source_path)
            .bind(doc_version)
            .bind(draft.metadata.context().chunk_no as i64)
            .bind(&draft.content)
            .bind(metadata_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Phase 2: attach vectors to already inserted rows, in one transaction.
    pub async fn fill_embeddings(&self, updates: &[(ChunkId, &[f32])]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for (chunk_id, vector) in updates {
            written += sqlx::query(
                "UPDATE chunks SET embedding = ?, embedding_dims = ? WHERE id = ?",
            )
            .bind(vec_to_blob(vector))
            .bind(vector.len() as i64)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Delete all chunks of one source. The document row is kept.
    pub async fn delete_exact(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
    ) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM chunks WHERE kb_id = ? AND source_type = ? AND source_path = ?",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(source_path)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Delete one source entirely: chunks, document and its versions.
    pub async fn delete_document(
        &self,
        kb_id: KbId,
        source_type: &str,
        source_path: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let chunks = sqlx::query(
            "DELETE FROM chunks WHERE kb_id = ? AND source_type = ? AND source_path = ?",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(source_path)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM documents WHERE kb_id = ? AND source_type = ? AND source_path = ?")
            .bind(kb_id)
            .bind(source_type)
            .bind(source_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(chunks)
    }

    /// Delete every chunk and document whose path starts with `prefix`.
    ///
    /// The prefix is matched literally. An empty prefix deletes nothing.
    pub async fn delete_prefix(&self, kb_id: KbId, source_type: &str, prefix: &str) -> Result<u64> {
        if prefix.is_empty() {
            return Ok(0);
        }
        let pattern = format!("{}%", escape_like(prefix));

        let mut tx = self.pool.begin().await?;
        let chunks = sqlx::query(
            "DELETE FROM chunks WHERE kb_id = ? AND source_type = ? AND source_path LIKE ? ESCAPE '\\'",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(&pattern)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(
            "DELETE FROM documents WHERE kb_id = ? AND source_type = ? AND source_path LIKE ? ESCAPE '\\'",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(chunks)
    }

    /// Delete chunks left over from a version other than their document's
    /// current one.
    pub async fn sweep_stale(&self, kb_id: KbId) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            DELETE FROM chunks
            WHERE kb_id = ?
              AND doc_version <> (SELECT d.current_version FROM documents d WHERE d.id = chunks.document_id)
            "#,
        )
        .bind(kb_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    // ============ Chunk reads ============

    /// Every chunk of `kb_id` that has a stored vector whose byte length
    /// agrees with its recorded `embedding_dims`.
    pub async fn load_for_index(&self, kb_id: KbId) -> Result<Vec<IndexRow>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE kb_id = ? AND embedding IS NOT NULL \
             AND length(embedding) = embedding_dims * 4 ORDER BY id",
        )
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                IndexRow {
                    vector: blob_to_vec(&blob),
                    record: Arc::new(record_from_row(row)),
                }
            })
            .collect())
    }

    /// Chunks of `kb_id` for keyword scoring.
    ///
    /// With a non-empty `prefilter`, only chunks whose content contains at
    /// least one of the tokens (case-insensitive) are returned.
    pub async fn load_for_keyword(&self, kb_id: KbId, prefilter: &[&str]) -> Result<Vec<ChunkRecord>> {
        let mut sql = String::from("SELECT * FROM chunks WHERE kb_id = ?");
        if !prefilter.is_empty() {
            let clauses = vec!["lower(content) LIKE ? ESCAPE '\\'"; prefilter.len()];
            sql.push_str(" AND (");
            sql.push_str(&clauses.join(" OR "));
            sql.push(')');
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query(&sql).bind(kb_id);
        for token in prefilter {
            query = query.bind(format!("%{}%", escape_like(&token.to_lowercase())));
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn count_chunks(&self, kb_id: KbId, source_type: &str, source_path: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE kb_id = ? AND source_type = ? AND source_path = ?",
        )
        .bind(kb_id)
        .bind(source_type)
        .bind(source_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// All chunks of `kb_id`, embedded or not.
    pub async fn chunk_total(&self, kb_id: KbId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE kb_id = ?")
            .bind(kb_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn stats(&self, kb_id: KbId) -> Result<KbStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE kb_id = ?")
            .bind(kb_id)
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE kb_id = ?")
            .bind(kb_id)
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE kb_id = ? AND embedding IS NOT NULL",
        )
        .bind(kb_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT d.source_type,
                   COUNT(DISTINCT d.id) AS doc_count,
                   COUNT(c.id) AS chunk_count
            FROM documents d
            LEFT JOIN chunks c ON c.document_id = d.id
            WHERE d.kb_id = ?
            GROUP BY d.source_type
            ORDER BY doc_count DESC, d.source_type
            "#,
        )
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(KbStats {
            documents,
            chunks,
            embedded,
            by_source_type: rows
                .iter()
                .map(|r| (r.get("source_type"), r.get("doc_count"), r.get("chunk_count")))
                .collect(),
        })
    }
}

fn record_from_row(row: &SqliteRow) -> ChunkRecord {
    let id: i64 = row.get("id");
    let raw: String = row.get("metadata_json");
    let metadata = serde_json::from_str::<ChunkMetadata>(&raw).unwrap_or_else(|e| {
        warn!(chunk_id = id, error = %e, "Unreadable chunk metadata, treating as text");
        ChunkMetadata::Text {
            context: ChunkContext::default(),
        }
    });
    ChunkRecord {
        id,
        kb_id: row.get("kb_id"),
        document_id: row.get("document_id"),
        source_type: row.get("source_type"),
        source_path: row.get("source_path"),
        doc_version: row.get("doc_version"),
        content: row.get("content"),
        metadata,
    }
}

/// Escape `\`, `%` and `_` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{ChunkKind, ChunkMetadata};
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ChunkStore) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("kb.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, ChunkStore::new(pool, config.chunking))
    }

    async fn document(store: &ChunkStore, kb_id: KbId, path: &str) -> DocumentId {
        sqlx::query(
            "INSERT INTO documents (kb_id, source_type, source_path, content_hash, document_class, \
             language, current_version, created_at, updated_at) VALUES (?, 'wiki', ?, 'h', 'text', 'en', 1, 0, 0)",
        )
        .bind(kb_id)
        .bind(path)
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn drafts(n: usize) -> Vec<ChunkDraft> {
        (0..n)
            .map(|i| ChunkDraft {
                content: format!("chunk body {}", i),
                metadata: ChunkMetadata::new(
                    ChunkKind::Text,
                    None,
                    ChunkContext {
                        chunk_no: i as u32,
                        doc_version: 1,
                        ..Default::default()
                    },
                ),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_duplicate_kb_name_rejected() {
        let (_tmp, store) = setup().await;
        let settings = KbSettings::defaults(&ChunkingConfig::default());
        store.create_kb("docs", None, &settings).await.unwrap();
        let err = store.create_kb("docs", None, &settings).await.unwrap_err();
        assert!(matches!(err, KbError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_two_phase_insert() {
        let (_tmp, store) = setup().await;
        let kb = store
            .create_kb("kb", None, &KbSettings::defaults(&ChunkingConfig::default()))
            .await
            .unwrap();
        let doc = document(&store, kb.id, "a").await;
        let ids = store.insert_rows(kb.id, doc, "wiki", "a", 1, &drafts(3)).await.unwrap();
        assert_eq!(ids.len(), 3);

        assert!(store.load_for_index(kb.id).await.unwrap().is_empty());
        assert_eq!(store.load_for_keyword(kb.id, &[]).await.unwrap().len(), 3);

        let v = vec![1.0f32, 0.0];
        store.fill_embeddings(&[(ids[0], v.as_slice())]).await.unwrap();
        let rows = store.load_for_index(kb.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.id, ids[0]);
        assert_eq!(rows[0].vector, v);
    }

    #[tokio::test]
    async fn test_index_load_skips_blob_with_wrong_recorded_dims() {
        let (_tmp, store) = setup().await;
        let kb = store
            .create_kb("kb", None, &KbSettings::defaults(&ChunkingConfig::default()))
            .await
            .unwrap();
        let doc = document(&store, kb.id, "a").await;
        let ids = store.insert_rows(kb.id, doc, "wiki", "a", 1, &drafts(2)).await.unwrap();
        let v = vec![0.5f32, 0.5];
        store
            .fill_embeddings(&[(ids[0], v.as_slice()), (ids[1], v.as_slice())])
            .await
            .unwrap();
        sqlx::query("UPDATE chunks SET embedding_dims = 3 WHERE id = ?")
            .bind(ids[1])
            .execute(store.pool())
            .await
            .unwrap();

        let rows = store.load_for_index(kb.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.id, ids[0]);
    }

    #[tokio::test]
    async fn test_delete_prefix_is_literal() {
        let (_tmp, store) = setup().await;
        let kb = store
            .create_kb("kb", None, &KbSettings::defaults(&ChunkingConfig::default()))
            .await
            .unwrap();
        for path in ["wiki/a_b/1", "wiki/a_b/2", "wiki/axb/3"] {
            let doc = document(&store, kb.id, path).await;
            store.insert_rows(kb.id, doc, "wiki", path, 1, &drafts(2)).await.unwrap();
        }

        assert_eq!(store.delete_prefix(kb.id, "wiki", "").await.unwrap(), 0);
        assert_eq!(store.delete_prefix(kb.id, "wiki", "wiki/a_b/").await.unwrap(), 4);
        let left = store.load_for_keyword(kb.id, &[]).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|c| c.source_path == "wiki/axb/3"));
    }

    #[tokio::test]
    async fn test_keyword_prefilter() {
        let (_tmp, store) = setup().await;
        let kb = store
            .create_kb("kb", None, &KbSettings::defaults(&ChunkingConfig::default()))
            .await
            .unwrap();
        let doc = document(&store, kb.id, "a").await;
        let mut items = drafts(2);
        items[1].content = "Run GIT clone first".into();
        store.insert_rows(kb.id, doc, "wiki", "a", 1, &items).await.unwrap();

        let hits = store.load_for_keyword(kb.id, &["git", "docker"]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("GIT"));
    }

    #[tokio::test]
    async fn test_delete_kb_cascades() {
        let (_tmp, store) = setup().await;
        let kb = store
            .create_kb("kb", None, &KbSettings::defaults(&ChunkingConfig::default()))
            .await
            .unwrap();
        let doc = document(&store, kb.id, "a").await;
        store.insert_rows(kb.id, doc, "wiki", "a", 1, &drafts(2)).await.unwrap();

        assert!(store.delete_kb(kb.id).await.unwrap());
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!((chunks, docs), (0, 0));
    }

    #[tokio::test]
    async fn test_update_settings_merges() {
        let (_tmp, store) = setup().await;
        let kb = store
            .create_kb("kb", None, &KbSettings::defaults(&ChunkingConfig::default()))
            .await
            .unwrap();
        let patch = serde_json::json!({"chunking": {"web": {"mode": "full"}}});
        store.update_kb_settings(kb.id, &patch).await.unwrap();
        let reloaded = store.get_kb(kb.id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.settings.chunk_options_for("web").mode,
            crate::models::ChunkMode::Full
        );
        assert_eq!(reloaded.settings.chunk_options_for("web").max_chars, 1800);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a_b%c\\"), "a\\_b\\%c\\\\");
    }
}
