//! Durable corpus store on SQLite.
//!
//! Holds documents, chunks and quantized chunk embeddings. The in-memory
//! [`EmbeddingIndex`](crate::EmbeddingIndex) is rebuilt from here at startup.
//! Replacing a document runs in one transaction: either the new document,
//! chunks and embeddings are all visible, or the old ones still are.

use std::path::{Path, PathBuf};

use ndarray::Array1;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use campuskb_core::{Error, Result};

use crate::embedding::Quantized;
use crate::schema::SCHEMA_SQL;
use crate::types::*;

pub struct CorpusStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

impl CorpusStore {
    /// Open or create the store. The file is `db_dir/corpus.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join("corpus.db");

        let conn = Connection::open(&db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Storage(format!("Schema init failed: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        let stats = store.stats()?;
        info!(
            "CorpusStore opened: {} documents, {} chunks, path={}",
            stats.total_documents,
            stats.total_chunks,
            store.db_path.display()
        );
        Ok(store)
    }

    // ---------------------------------------------------------------
    // Documents
    // ---------------------------------------------------------------

    /// Store a document with its chunks and embeddings, superseding any
    /// document with the same logical key. Returns the superseded id.
    pub fn replace_document(
        &self,
        document: &Document,
        chunks: &[Chunk],
        embeddings: &[Array1<f32>],
        model_version: &str,
    ) -> Result<Option<String>> {
        if chunks.len() != embeddings.len() {
            return Err(Error::InvalidRequest(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT id FROM documents WHERE logical_key = ?1",
                params![document.logical_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(old_id) = &previous {
            tx.execute("DELETE FROM documents WHERE id = ?1", params![old_id])
                .map_err(db_err)?;
        }

        tx.execute(
            "INSERT INTO documents (id, logical_key, source_type, title, category, form, \
             source, content_hash, body, created_at, seq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
             (SELECT COALESCE(MAX(seq), 0) + 1 FROM documents))",
            params![
                document.id,
                document.logical_key,
                document.source_type.as_str(),
                document.metadata.title,
                document.metadata.category,
                document.metadata.form.as_str(),
                document.metadata.source,
                document.content_hash,
                document.text,
                document.created_at,
            ],
        )
        .map_err(db_err)?;

        {
            let mut insert_chunk = tx
                .prepare_cached(
                    "INSERT INTO chunks (id, document_id, ordinal, text, char_start, char_end, \
                     token_estimate) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .map_err(db_err)?;
            let mut insert_embedding = tx
                .prepare_cached(
                    "INSERT INTO chunk_embeddings (chunk_id, embedding, scale, offset_val, \
                     model_version) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(db_err)?;

            for (chunk, vector) in chunks.iter().zip(embeddings) {
                insert_chunk
                    .execute(params![
                        chunk.id,
                        chunk.document_id,
                        chunk.ordinal,
                        chunk.text,
                        chunk.start as i64,
                        chunk.end as i64,
                        chunk.token_estimate as i64,
                    ])
                    .map_err(db_err)?;
                let q = Quantized::encode(vector);
                insert_embedding
                    .execute(params![chunk.id, q.bytes, q.scale, q.offset, model_version])
                    .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)?;
        debug!(
            "Stored document {} ({} chunks, key={})",
            document.id,
            chunks.len(),
            document.logical_key
        );
        Ok(previous)
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM documents WHERE id = ?1")
            .map_err(db_err)?;
        let document = stmt
            .query_row(params![id], Self::row_to_document)
            .optional()
            .map_err(db_err)?;
        Ok(document)
    }

    pub fn find_by_key(&self, logical_key: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM documents WHERE logical_key = ?1")
            .map_err(db_err)?;
        let document = stmt
            .query_row(params![logical_key], Self::row_to_document)
            .optional()
            .map_err(db_err)?;
        Ok(document)
    }

    /// Delete a document; chunks and embeddings cascade.
    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(count > 0)
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT d.id, d.logical_key, d.title, d.source_type, d.category, d.created_at, \
                 (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id) AS chunk_count \
                 FROM documents d ORDER BY d.seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DocumentSummary {
                    id: row.get("id")?,
                    logical_key: row.get("logical_key")?,
                    title: row.get("title")?,
                    source_type: parse_source_type(row, "source_type")?,
                    category: row.get("category")?,
                    chunk_count: row.get::<_, i64>("chunk_count")? as usize,
                    created_at: row.get("created_at")?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Chunks and embeddings
    // ---------------------------------------------------------------

    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY ordinal")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![document_id], Self::row_to_chunk)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Every chunk with its provenance and stored embedding, in document
    /// insertion order, then chunk order.
    pub fn load_all(&self) -> Result<Vec<StoredChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.*, d.title, d.source, e.embedding, e.scale, e.offset_val, \
                 e.model_version FROM chunks c \
                 JOIN documents d ON d.id = c.document_id \
                 LEFT JOIN chunk_embeddings e ON e.chunk_id = c.id \
                 ORDER BY d.seq, c.ordinal",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let chunk = Self::row_to_chunk(row)?;
                let bytes: Option<Vec<u8>> = row.get("embedding")?;
                let embedding = match bytes {
                    Some(bytes) => Some(StoredEmbedding {
                        vector: Quantized {
                            bytes,
                            scale: row.get::<_, f64>("scale")? as f32,
                            offset: row.get::<_, f64>("offset_val")? as f32,
                        }
                        .decode(),
                        model_version: row.get("model_version")?,
                    }),
                    None => None,
                };
                Ok(StoredChunk {
                    record: ChunkRecord {
                        chunk,
                        title: row.get("title")?,
                        source: row.get("source")?,
                    },
                    embedding,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Overwrite a chunk's embedding, e.g. after an embedding model change.
    pub fn update_embedding(
        &self,
        chunk_id: &str,
        vector: &Array1<f32>,
        model_version: &str,
    ) -> Result<()> {
        let q = Quantized::encode(vector);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chunk_embeddings (chunk_id, embedding, scale, offset_val, \
             model_version) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chunk_id, q.bytes, q.scale, q.offset, model_version],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<usize> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(db_err)
        };
        let total_documents = count("SELECT COUNT(*) FROM documents")?;
        let total_chunks = count("SELECT COUNT(*) FROM chunks")?;
        let embeddings_stored = count("SELECT COUNT(*) FROM chunk_embeddings")?;
        drop(conn);

        let db_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            total_documents,
            total_chunks,
            embeddings_stored,
            db_path: self.db_path.to_string_lossy().to_string(),
            db_size_mb: db_size as f64 / (1024.0 * 1024.0),
        })
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
        let form: String = row.get("form")?;
        Ok(Document {
            id: row.get("id")?,
            logical_key: row.get("logical_key")?,
            source_type: parse_source_type(row, "source_type")?,
            metadata: DocumentMetadata {
                title: row.get("title")?,
                category: row.get("category")?,
                form: if form == "short" {
                    ContentForm::Short
                } else {
                    ContentForm::Long
                },
                source: row.get("source")?,
            },
            content_hash: row.get("content_hash")?,
            text: row.get("body")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
        Ok(Chunk {
            id: row.get("id")?,
            document_id: row.get("document_id")?,
            ordinal: row.get("ordinal")?,
            text: row.get("text")?,
            start: row.get::<_, i64>("char_start")? as usize,
            end: row.get::<_, i64>("char_end")? as usize,
            token_estimate: row.get::<_, i64>("token_estimate")? as usize,
        })
    }
}

fn parse_source_type(row: &Row<'_>, column: &str) -> rusqlite::Result<SourceType> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn test_store() -> (CorpusStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CorpusStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn document(key: &str, text: &str, created_at: i64) -> Document {
        let hash = content_hash(text.as_bytes());
        Document {
            id: document_id(key, &hash),
            logical_key: key.to_string(),
            source_type: SourceType::Text,
            metadata: DocumentMetadata {
                title: key.to_uppercase(),
                source: Some(format!("{}.txt", key)),
                ..Default::default()
            },
            content_hash: hash,
            text: text.to_string(),
            created_at,
        }
    }

    fn chunks(doc: &Document, n: u32) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                id: chunk_id(&doc.id, i),
                document_id: doc.id.clone(),
                ordinal: i,
                text: format!("part {}", i),
                start: 0,
                end: doc.text.len(),
                token_estimate: 2,
            })
            .collect()
    }

    #[test]
    fn test_store_and_load() {
        let (store, _dir) = test_store();
        let doc = document("calendar", "Classes start Monday.", 1);
        let chunks = chunks(&doc, 2);
        let vectors = vec![array![1.0, 0.0], array![0.0, 1.0]];
        assert_eq!(store.replace_document(&doc, &chunks, &vectors, "v1").unwrap(), None);

        let loaded = store.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(loaded.text, doc.text);
        assert_eq!(loaded.metadata, doc.metadata);
        assert_eq!(store.chunks_for_document(&doc.id).unwrap(), chunks);

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].record.title, "CALENDAR");
        let emb = all[1].embedding.as_ref().unwrap();
        assert_eq!(emb.model_version, "v1");
        assert!((emb.vector[1] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_replace_by_logical_key() {
        let (store, _dir) = test_store();
        let old = document("library", "Open 9 to 5.", 1);
        store
            .replace_document(&old, &chunks(&old, 3), &vec![array![1.0]; 3], "v1")
            .unwrap();

        let new = document("library", "Open 24/7.", 2);
        let replaced = store
            .replace_document(&new, &chunks(&new, 1), &[array![1.0]], "v1")
            .unwrap();
        assert_eq!(replaced.as_deref(), Some(old.id.as_str()));

        assert!(store.get_document(&old.id).unwrap().is_none());
        assert!(store.chunks_for_document(&old.id).unwrap().is_empty());
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_documents, 1);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.embeddings_stored, 1);
    }

    #[test]
    fn test_load_follows_insertion_order() {
        let (store, _dir) = test_store();
        // Timestamps deliberately disagree with insertion order.
        let a = document("a", "alpha", 50);
        let b = document("b", "beta", 10);
        store.replace_document(&a, &chunks(&a, 1), &[array![1.0]], "v1").unwrap();
        store.replace_document(&b, &chunks(&b, 1), &[array![1.0]], "v1").unwrap();

        let keys = |store: &CorpusStore| -> Vec<String> {
            store
                .list_documents()
                .unwrap()
                .into_iter()
                .map(|d| d.logical_key)
                .collect()
        };
        assert_eq!(keys(&store), ["a", "b"]);

        // A superseding version moves to the end.
        let a2 = document("a", "alpha two", 1);
        store.replace_document(&a2, &chunks(&a2, 2), &vec![array![1.0]; 2], "v1").unwrap();
        assert_eq!(keys(&store), ["b", "a"]);

        let loaded: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|c| c.record.chunk.document_id)
            .collect();
        assert_eq!(loaded, [b.id.clone(), a2.id.clone(), a2.id.clone()]);
    }

    #[test]
    fn test_mismatched_embeddings_rejected() {
        let (store, _dir) = test_store();
        let doc = document("a", "text", 1);
        let err = store.replace_document(&doc, &chunks(&doc, 2), &[array![1.0]], "v1");
        assert!(matches!(err, Err(Error::InvalidRequest(_))));
        assert_eq!(store.stats().unwrap().total_documents, 0);
    }

    #[test]
    fn test_delete_cascades() {
        let (store, _dir) = test_store();
        let doc = document("a", "text", 1);
        store
            .replace_document(&doc, &chunks(&doc, 2), &vec![array![1.0]; 2], "v1")
            .unwrap();
        assert!(store.delete_document(&doc.id).unwrap());
        assert!(!store.delete_document(&doc.id).unwrap());
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.embeddings_stored, 0);
    }

    #[test]
    fn test_list_and_update_embedding() {
        let (store, _dir) = test_store();
        let a = document("a", "alpha", 1);
        let b = document("b", "beta", 2);
        store.replace_document(&a, &chunks(&a, 1), &[array![1.0, 0.0]], "v1").unwrap();
        store.replace_document(&b, &chunks(&b, 2), &vec![array![0.0, 1.0]; 2], "v1").unwrap();

        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].logical_key, "a");
        assert_eq!(listed[1].chunk_count, 2);

        store
            .update_embedding(&chunk_id(&a.id, 0), &array![0.0, 1.0], "v2")
            .unwrap();
        let all = store.load_all().unwrap();
        let emb = all[0].embedding.as_ref().unwrap();
        assert_eq!(emb.model_version, "v2");
        assert!(store.find_by_key("b").unwrap().is_some());
    }
}
