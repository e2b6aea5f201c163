//! PostgreSQL adapter
//!
//! Staging tables are UNLOGGED and unindexed so COPY can append at disk
//! speed; the merge step moves rows into the constrained final tables with
//! `ON CONFLICT` upserts. The load history table is the single source of
//! truth for what has already been processed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use sqlx::QueryBuilder;
use tracing::{debug, info};

use super::copy::CopyRow;
use super::{chunk_table_counts, normalized_tables, DatabaseAdapter, OptimizeStage, StateUpdate};
use crate::model::{LoadHistory, LoadMode, LoadStatus};
use crate::parser::UpsertChunk;

/// Connection pool size; operations are sequential, so this stays small
const MAX_CONNECTIONS: u32 = 5;

/// File type recorded when a row is created before its type is known
const UNKNOWN_FILE_TYPE: &str = "UNKNOWN";

/// PostgreSQL implementation of the loader's storage contract
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by integration tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stream encoded rows into a staging table through the COPY protocol
    async fn copy_rows(&self, statement: &str, rows: Vec<String>) -> Result<()> {
        let mut sink = self
            .pool
            .copy_in_raw(statement)
            .await
            .with_context(|| format!("Failed to start bulk copy: {}", statement))?;

        for row in rows {
            sink.send(row.into_bytes())
                .await
                .context("Bulk copy write failed")?;
        }

        sink.finish().await.context("Bulk copy finish failed")?;
        Ok(())
    }

    async fn merge_full(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        is_initial_load: bool,
    ) -> Result<()> {
        if is_initial_load {
            sqlx::query("INSERT INTO citations_json SELECT * FROM _staging_citations_json")
                .execute(&mut **tx)
                .await
                .context("Initial insert into citations_json failed")?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO citations_json (pmid, date_revised, data)
                SELECT pmid, date_revised, data FROM _staging_citations_json
                ON CONFLICT (pmid) DO UPDATE SET
                    date_revised = EXCLUDED.date_revised,
                    data = EXCLUDED.data
                "#,
            )
            .execute(&mut **tx)
            .await
            .context("Upsert into citations_json failed")?;
        }

        sqlx::query("DROP TABLE _staging_citations_json")
            .execute(&mut **tx)
            .await
            .context("Failed to drop citations_json staging table")?;

        Ok(())
    }

    async fn merge_normalized(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        is_initial_load: bool,
    ) -> Result<()> {
        // Dimension tables keep their constraints even during an initial
        // load, so first-seen-wins inserts are always valid
        for (table, pk) in [
            ("journals", "issn"),
            ("authors", "author_id"),
            ("mesh_terms", "mesh_id"),
        ] {
            sqlx::query(&format!(
                "INSERT INTO {table} SELECT * FROM _staging_{table} ON CONFLICT ({pk}) DO NOTHING"
            ))
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Merge into {} failed", table))?;
        }

        if is_initial_load {
            for table in ["citations", "citation_authors", "citation_mesh_terms"] {
                sqlx::query(&format!("INSERT INTO {table} SELECT * FROM _staging_{table}"))
                    .execute(&mut **tx)
                    .await
                    .with_context(|| format!("Initial insert into {} failed", table))?;
            }
        } else {
            sqlx::query(
                r#"
                INSERT INTO citations (pmid, title, abstract, publication_date, journal_issn)
                SELECT pmid, title, abstract, publication_date, journal_issn
                FROM _staging_citations
                ON CONFLICT (pmid) DO UPDATE SET
                    title = EXCLUDED.title,
                    abstract = EXCLUDED.abstract,
                    publication_date = EXCLUDED.publication_date,
                    journal_issn = EXCLUDED.journal_issn
                "#,
            )
            .execute(&mut **tx)
            .await
            .context("Upsert into citations failed")?;

            sqlx::query(
                r#"
                INSERT INTO citation_authors (pmid, author_id, display_order)
                SELECT pmid, author_id, display_order FROM _staging_citation_authors
                ON CONFLICT (pmid, author_id) DO UPDATE SET
                    display_order = EXCLUDED.display_order
                "#,
            )
            .execute(&mut **tx)
            .await
            .context("Upsert into citation_authors failed")?;

            sqlx::query(
                r#"
                INSERT INTO citation_mesh_terms (pmid, mesh_id)
                SELECT pmid, mesh_id FROM _staging_citation_mesh_terms
                ON CONFLICT (pmid, mesh_id) DO NOTHING
                "#,
            )
            .execute(&mut **tx)
            .await
            .context("Merge into citation_mesh_terms failed")?;
        }

        for table in normalized_tables() {
            sqlx::query(&format!("DROP TABLE _staging_{table}"))
                .execute(&mut **tx)
                .await
                .with_context(|| format!("Failed to drop staging table for {}", table))?;
        }

        Ok(())
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn initialize_schema(&self, mode: LoadMode) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _pubmed_load_history (
                file_name TEXT PRIMARY KEY,
                file_type TEXT NOT NULL,
                md5_checksum TEXT,
                download_timestamp TIMESTAMPTZ,
                load_start_timestamp TIMESTAMPTZ,
                load_end_timestamp TIMESTAMPTZ,
                status TEXT NOT NULL,
                records_processed INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create load history table")?;

        if mode.includes_full() {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS citations_json (
                    pmid INTEGER PRIMARY KEY,
                    date_revised DATE,
                    data JSONB NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .context("Failed to create citations_json table")?;
        }

        if mode.includes_normalized() {
            let statements = [
                r#"CREATE TABLE IF NOT EXISTS journals (
                    issn TEXT PRIMARY KEY,
                    title TEXT,
                    iso_abbreviation TEXT
                )"#,
                r#"CREATE TABLE IF NOT EXISTS authors (
                    author_id BIGINT PRIMARY KEY,
                    last_name TEXT,
                    fore_name TEXT,
                    initials TEXT
                )"#,
                r#"CREATE TABLE IF NOT EXISTS mesh_terms (
                    mesh_id BIGINT PRIMARY KEY,
                    term TEXT,
                    is_major_topic BOOLEAN
                )"#,
                r#"CREATE TABLE IF NOT EXISTS citations (
                    pmid INTEGER PRIMARY KEY,
                    title TEXT,
                    abstract TEXT,
                    publication_date DATE,
                    journal_issn TEXT REFERENCES journals(issn)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS citation_authors (
                    pmid INTEGER REFERENCES citations(pmid) ON DELETE CASCADE,
                    author_id BIGINT REFERENCES authors(author_id),
                    display_order INTEGER,
                    PRIMARY KEY (pmid, author_id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS citation_mesh_terms (
                    pmid INTEGER REFERENCES citations(pmid) ON DELETE CASCADE,
                    mesh_id BIGINT REFERENCES mesh_terms(mesh_id),
                    PRIMARY KEY (pmid, mesh_id)
                )"#,
            ];
            for statement in statements {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .context("Failed to create normalized table")?;
            }
        }

        info!(mode = %mode, "Database schema initialized");
        Ok(())
    }

    async fn create_staging_tables(&self, mode: LoadMode) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if mode.includes_full() {
            sqlx::query("DROP TABLE IF EXISTS _staging_citations_json")
                .execute(&mut *tx)
                .await
                .context("Failed to drop stale citations_json staging table")?;
            sqlx::query(
                r#"
                CREATE UNLOGGED TABLE _staging_citations_json (
                    pmid INTEGER,
                    date_revised DATE,
                    data JSONB
                )
                "#,
            )
            .execute(&mut *tx)
            .await
            .context("Failed to create citations_json staging table")?;
        }

        if mode.includes_normalized() {
            for table in normalized_tables() {
                sqlx::query(&format!("DROP TABLE IF EXISTS _staging_{table}"))
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to drop stale staging table for {}", table))?;
                sqlx::query(&format!(
                    "CREATE UNLOGGED TABLE _staging_{table} (LIKE {table} INCLUDING DEFAULTS)"
                ))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to create staging table for {}", table))?;
            }
        }

        tx.commit().await.context("Failed to commit staging setup")?;
        debug!(mode = %mode, "Staging tables created");
        Ok(())
    }

    async fn bulk_load_chunk(&self, chunk: &UpsertChunk) -> Result<()> {
        if !chunk.documents.is_empty() {
            let mut rows = Vec::with_capacity(chunk.documents.len());
            for doc in &chunk.documents {
                let payload = serde_json::to_string(&doc.payload_json())
                    .context("Failed to serialize citation document")?;
                rows.push(
                    CopyRow::new()
                        .int(doc.pmid as i64)
                        .opt_date(doc.date_revised)
                        .text(&payload)
                        .finish(),
                );
            }
            self.copy_rows(
                "COPY _staging_citations_json (pmid, date_revised, data) FROM STDIN",
                rows,
            )
            .await?;
        }

        if !chunk.journals.is_empty() {
            let rows = chunk
                .journals
                .iter()
                .map(|journal| {
                    CopyRow::new()
                        .text(&journal.issn)
                        .opt_text(journal.title.as_deref())
                        .opt_text(journal.iso_abbreviation.as_deref())
                        .finish()
                })
                .collect();
            self.copy_rows(
                "COPY _staging_journals (issn, title, iso_abbreviation) FROM STDIN",
                rows,
            )
            .await?;
        }

        if !chunk.authors.is_empty() {
            let rows = chunk
                .authors
                .iter()
                .map(|author| {
                    CopyRow::new()
                        .int(author.author_id)
                        .opt_text(author.last_name.as_deref())
                        .opt_text(author.fore_name.as_deref())
                        .opt_text(author.initials.as_deref())
                        .finish()
                })
                .collect();
            self.copy_rows(
                "COPY _staging_authors (author_id, last_name, fore_name, initials) FROM STDIN",
                rows,
            )
            .await?;
        }

        if !chunk.mesh_terms.is_empty() {
            let rows = chunk
                .mesh_terms
                .iter()
                .map(|term| {
                    CopyRow::new()
                        .int(term.mesh_id)
                        .text(&term.term)
                        .bool(term.is_major_topic)
                        .finish()
                })
                .collect();
            self.copy_rows(
                "COPY _staging_mesh_terms (mesh_id, term, is_major_topic) FROM STDIN",
                rows,
            )
            .await?;
        }

        if !chunk.citations.is_empty() {
            let rows = chunk
                .citations
                .iter()
                .map(|citation| {
                    CopyRow::new()
                        .int(citation.pmid as i64)
                        .opt_text(citation.title.as_deref())
                        .opt_text(citation.abstract_text.as_deref())
                        .opt_date(citation.publication_date)
                        .opt_text(citation.journal_issn.as_deref())
                        .finish()
                })
                .collect();
            self.copy_rows(
                "COPY _staging_citations (pmid, title, abstract, publication_date, journal_issn) FROM STDIN",
                rows,
            )
            .await?;
        }

        if !chunk.citation_authors.is_empty() {
            let rows = chunk
                .citation_authors
                .iter()
                .map(|link| {
                    CopyRow::new()
                        .int(link.pmid as i64)
                        .int(link.author_id)
                        .int(link.display_order as i64)
                        .finish()
                })
                .collect();
            self.copy_rows(
                "COPY _staging_citation_authors (pmid, author_id, display_order) FROM STDIN",
                rows,
            )
            .await?;
        }

        if !chunk.citation_mesh_terms.is_empty() {
            let rows = chunk
                .citation_mesh_terms
                .iter()
                .map(|link| {
                    CopyRow::new()
                        .int(link.pmid as i64)
                        .int(link.mesh_id)
                        .finish()
                })
                .collect();
            self.copy_rows(
                "COPY _staging_citation_mesh_terms (pmid, mesh_id) FROM STDIN",
                rows,
            )
            .await?;
        }

        debug!(tables = ?chunk_table_counts(chunk), "Staged upsert chunk");
        Ok(())
    }

    async fn process_deletions(&self, pmids: &[i32], mode: LoadMode) -> Result<u64> {
        if pmids.is_empty() {
            return Ok(0);
        }

        let mut removed = 0u64;

        if mode.includes_full() {
            let result = sqlx::query("DELETE FROM citations_json WHERE pmid = ANY($1)")
                .bind(pmids)
                .execute(&self.pool)
                .await
                .context("Failed to delete from citations_json")?;
            removed += result.rows_affected();
        }

        if mode.includes_normalized() {
            // Link rows follow through ON DELETE CASCADE
            let result = sqlx::query("DELETE FROM citations WHERE pmid = ANY($1)")
                .bind(pmids)
                .execute(&self.pool)
                .await
                .context("Failed to delete from citations")?;
            removed += result.rows_affected();
        }

        debug!(requested = pmids.len(), removed, mode = %mode, "Processed deletions");
        Ok(removed)
    }

    async fn execute_merge_strategy(&self, mode: LoadMode, is_initial_load: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if mode.includes_full() {
            self.merge_full(&mut tx, is_initial_load).await?;
        }
        if mode.includes_normalized() {
            self.merge_normalized(&mut tx, is_initial_load).await?;
        }

        tx.commit().await.context("Failed to commit merge")?;
        info!(mode = %mode, is_initial_load, "Merged staged data into final tables");
        Ok(())
    }

    async fn manage_load_state(
        &self,
        file_name: &str,
        status: LoadStatus,
        update: StateUpdate,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Ensure the row exists before updating it; a row created here starts
        // as PENDING with an UNKNOWN type until the caller supplies one
        sqlx::query(
            r#"
            INSERT INTO _pubmed_load_history (file_name, file_type, status)
            VALUES ($1, $2, 'PENDING')
            ON CONFLICT (file_name) DO NOTHING
            "#,
        )
        .bind(file_name)
        .bind(
            update
                .file_type
                .map(|t| t.as_str().to_owned())
                .unwrap_or_else(|| UNKNOWN_FILE_TYPE.to_owned()),
        )
        .execute(&mut *tx)
        .await
        .context("Failed to ensure load history row")?;

        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("UPDATE _pubmed_load_history SET status = ");
        builder.push_bind(status.as_str());

        if let Some(file_type) = update.file_type {
            builder.push(", file_type = ");
            builder.push_bind(file_type.as_str().to_owned());
        }
        if let Some(checksum) = &update.md5_checksum {
            builder.push(", md5_checksum = ");
            builder.push_bind(checksum.as_str());
        }
        match status {
            LoadStatus::Downloading => {
                builder.push(", download_timestamp = NOW()");
            },
            LoadStatus::Loading => {
                builder.push(", load_start_timestamp = NOW()");
            },
            LoadStatus::Complete | LoadStatus::Failed => {
                builder.push(", load_end_timestamp = NOW()");
            },
            LoadStatus::Pending => {},
        }
        if let Some(records) = update.records_processed {
            builder.push(", records_processed = ");
            builder.push_bind(records);
        }
        builder.push(" WHERE file_name = ");
        builder.push_bind(file_name);

        builder
            .build()
            .execute(&mut *tx)
            .await
            .context("Failed to update load history row")?;

        tx.commit().await.context("Failed to commit state transition")?;
        debug!(file_name, status = status.as_str(), "Recorded load state transition");
        Ok(())
    }

    async fn optimize_database(&self, stage: OptimizeStage, mode: LoadMode) -> Result<()> {
        let statements: Vec<&str> = match stage {
            OptimizeStage::PreLoad => {
                info!(mode = %mode, "Dropping key constraints for initial load");
                let mut stmts = Vec::new();
                if mode.includes_full() {
                    stmts.push(
                        "ALTER TABLE IF EXISTS citations_json \
                         DROP CONSTRAINT IF EXISTS citations_json_pkey",
                    );
                }
                if mode.includes_normalized() {
                    stmts.push(
                        "ALTER TABLE IF EXISTS citation_authors \
                         DROP CONSTRAINT IF EXISTS citation_authors_pkey",
                    );
                    stmts.push(
                        "ALTER TABLE IF EXISTS citation_mesh_terms \
                         DROP CONSTRAINT IF EXISTS citation_mesh_terms_pkey",
                    );
                    stmts.push(
                        "ALTER TABLE IF EXISTS citations \
                         DROP CONSTRAINT IF EXISTS citations_pkey",
                    );
                }
                stmts
            },
            OptimizeStage::PostLoad => {
                info!(mode = %mode, "Recreating key constraints after initial load");
                let mut stmts = Vec::new();
                if mode.includes_full() {
                    stmts.push(
                        "ALTER TABLE IF EXISTS citations_json \
                         ADD CONSTRAINT citations_json_pkey PRIMARY KEY (pmid)",
                    );
                }
                if mode.includes_normalized() {
                    stmts.push(
                        "ALTER TABLE IF EXISTS citations \
                         ADD CONSTRAINT citations_pkey PRIMARY KEY (pmid)",
                    );
                    stmts.push(
                        "ALTER TABLE IF EXISTS citation_authors \
                         ADD CONSTRAINT citation_authors_pkey PRIMARY KEY (pmid, author_id)",
                    );
                    stmts.push(
                        "ALTER TABLE IF EXISTS citation_mesh_terms \
                         ADD CONSTRAINT citation_mesh_terms_pkey PRIMARY KEY (pmid, mesh_id)",
                    );
                }
                stmts
            },
        };

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Optimization statement failed: {}", statement))?;
        }

        Ok(())
    }

    async fn get_completed_files(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT file_name FROM _pubmed_load_history WHERE status = 'COMPLETE'",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query completed files")
    }

    async fn get_load_history(&self) -> Result<Vec<LoadHistory>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT file_name, file_type, md5_checksum, download_timestamp,
                   load_start_timestamp, load_end_timestamp, status, records_processed
            FROM _pubmed_load_history
            ORDER BY file_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query load history")?;

        Ok(rows.into_iter().map(HistoryRow::into_model).collect())
    }

    async fn reset_failed_files(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE _pubmed_load_history SET status = 'PENDING' WHERE status = 'FAILED'",
        )
        .execute(&self.pool)
        .await
        .context("Failed to reset failed files")?;

        Ok(result.rows_affected())
    }

    async fn has_completed_baseline(&self) -> Result<bool> {
        let row = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM _pubmed_load_history \
             WHERE status = 'COMPLETE' AND file_type = 'BASELINE' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check baseline completion")?;

        Ok(row.is_some())
    }
}

/// Raw load history row as stored
#[derive(sqlx::FromRow)]
struct HistoryRow {
    file_name: String,
    file_type: String,
    md5_checksum: Option<String>,
    download_timestamp: Option<DateTime<Utc>>,
    load_start_timestamp: Option<DateTime<Utc>>,
    load_end_timestamp: Option<DateTime<Utc>>,
    status: String,
    records_processed: Option<i32>,
}

impl HistoryRow {
    fn into_model(self) -> LoadHistory {
        LoadHistory {
            file_name: self.file_name,
            file_type: self.file_type,
            md5_checksum: self.md5_checksum,
            download_timestamp: self.download_timestamp,
            load_start_timestamp: self.load_start_timestamp,
            load_end_timestamp: self.load_end_timestamp,
            status: LoadStatus::from(self.status),
            records_processed: self.records_processed,
        }
    }
}
