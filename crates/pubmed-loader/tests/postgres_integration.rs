//! Adapter integration tests against a live PostgreSQL instance
//!
//! These tests connect to `TEST_DATABASE_URL` and pass trivially when the
//! variable is not set, so the suite stays green without a database:
//!
//! ```sh
//! TEST_DATABASE_URL=postgres://localhost/pubmed_test cargo test
//! ```

use std::io::Cursor;

use pubmed_loader::db::{DatabaseAdapter, OptimizeStage, PostgresAdapter, StateUpdate};
use pubmed_loader::model::{FileType, LoadMode, LoadStatus};
use pubmed_loader::parser::{CitationStream, OperationChunk};
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const FIXTURE_XML: &str = r#"<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE">
      <PMID Version="1">11111</PMID>
      <DateRevised><Year>2022</Year><Month>10</Month><Day>15</Day></DateRevised>
      <Article>
        <Journal>
          <ISSN>1234-5678</ISSN>
          <Title>Journal of Tests</Title>
          <ISOAbbreviation>J Test</ISOAbbreviation>
          <JournalIssue><PubDate><Year>2022</Year><Month>Feb</Month></PubDate></JournalIssue>
        </Journal>
        <ArticleTitle>First article</ArticleTitle>
        <Abstract><AbstractText>Alpha abstract</AbstractText></Abstract>
        <AuthorList>
          <Author><LastName>Smith</LastName><ForeName>Jane</ForeName><Initials>J</Initials></Author>
        </AuthorList>
      </Article>
      <MeshHeadingList>
        <MeshHeading><DescriptorName UI="D006801" MajorTopicYN="Y">Humans</DescriptorName></MeshHeading>
      </MeshHeadingList>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>22222</PMID>
      <Article><ArticleTitle>Second article</ArticleTitle></Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>
"#;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to TEST_DATABASE_URL");
    Some(pool)
}

async fn reset_database(pool: &PgPool) {
    for table in [
        "_pubmed_load_history",
        "citation_authors",
        "citation_mesh_terms",
        "citations",
        "citations_json",
        "journals",
        "authors",
        "mesh_terms",
        "_staging_citations_json",
        "_staging_journals",
        "_staging_authors",
        "_staging_mesh_terms",
        "_staging_citations",
        "_staging_citation_authors",
        "_staging_citation_mesh_terms",
    ] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .execute(pool)
            .await
            .expect("Failed to drop table");
    }
}

fn parse_fixture(mode: LoadMode) -> Vec<OperationChunk> {
    CitationStream::from_reader(Cursor::new(FIXTURE_XML.as_bytes().to_vec()), mode, 100)
        .collect::<Result<Vec<_>, _>>()
        .expect("Fixture should parse")
}

async fn stage_fixture(adapter: &PostgresAdapter, mode: LoadMode) {
    adapter.create_staging_tables(mode).await.unwrap();
    for chunk in parse_fixture(mode) {
        if let OperationChunk::Upsert(chunk) = chunk {
            adapter.bulk_load_chunk(&chunk).await.unwrap();
        }
    }
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
async fn test_merge_roundtrip_and_idempotence() {
    let Some(pool) = test_pool().await else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    reset_database(&pool).await;
    let adapter = PostgresAdapter::from_pool(pool.clone());

    adapter.initialize_schema(LoadMode::Both).await.unwrap();

    stage_fixture(&adapter, LoadMode::Both).await;
    adapter
        .execute_merge_strategy(LoadMode::Both, false)
        .await
        .unwrap();

    assert_eq!(count(&pool, "citations_json").await, 2);
    assert_eq!(count(&pool, "citations").await, 2);
    assert_eq!(count(&pool, "journals").await, 1);
    assert_eq!(count(&pool, "authors").await, 1);
    assert_eq!(count(&pool, "citation_authors").await, 1);
    assert_eq!(count(&pool, "mesh_terms").await, 1);
    assert_eq!(count(&pool, "citation_mesh_terms").await, 1);

    // Staging tables are dropped after the merge
    let staging_left = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM pg_tables WHERE tablename LIKE '\\_staging\\_%'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(staging_left, 0);

    // Applying the same file again overwrites rather than duplicates
    stage_fixture(&adapter, LoadMode::Both).await;
    adapter
        .execute_merge_strategy(LoadMode::Both, false)
        .await
        .unwrap();

    assert_eq!(count(&pool, "citations_json").await, 2);
    assert_eq!(count(&pool, "citations").await, 2);
    assert_eq!(count(&pool, "citation_authors").await, 1);

    let title = sqlx::query_scalar::<_, Option<String>>(
        "SELECT title FROM citations WHERE pmid = 11111",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(title.as_deref(), Some("First article"));

    let payload = sqlx::query_scalar::<_, serde_json::Value>(
        "SELECT data FROM citations_json WHERE pmid = 11111",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payload["MedlineCitation"]["PMID"]["#text"], "11111");
}

#[tokio::test]
#[serial]
async fn test_deletions_remove_final_rows() {
    let Some(pool) = test_pool().await else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    reset_database(&pool).await;
    let adapter = PostgresAdapter::from_pool(pool.clone());

    adapter.initialize_schema(LoadMode::Both).await.unwrap();
    stage_fixture(&adapter, LoadMode::Both).await;
    adapter
        .execute_merge_strategy(LoadMode::Both, false)
        .await
        .unwrap();

    // Unknown PMIDs are a no-op
    let removed = adapter
        .process_deletions(&[424242], LoadMode::Both)
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let removed = adapter
        .process_deletions(&[11111], LoadMode::Both)
        .await
        .unwrap();
    // One row from each representation
    assert_eq!(removed, 2);

    assert_eq!(count(&pool, "citations_json").await, 1);
    assert_eq!(count(&pool, "citations").await, 1);
    // Link rows cascade away; dimensions stay
    assert_eq!(count(&pool, "citation_authors").await, 0);
    assert_eq!(count(&pool, "authors").await, 1);
}

#[tokio::test]
#[serial]
async fn test_initial_load_with_optimization() {
    let Some(pool) = test_pool().await else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    reset_database(&pool).await;
    let adapter = PostgresAdapter::from_pool(pool.clone());

    adapter.initialize_schema(LoadMode::Full).await.unwrap();
    adapter
        .optimize_database(OptimizeStage::PreLoad, LoadMode::Full)
        .await
        .unwrap();

    stage_fixture(&adapter, LoadMode::Full).await;
    adapter
        .execute_merge_strategy(LoadMode::Full, true)
        .await
        .unwrap();

    adapter
        .optimize_database(OptimizeStage::PostLoad, LoadMode::Full)
        .await
        .unwrap();

    assert_eq!(count(&pool, "citations_json").await, 2);

    // The primary key is back after post-load optimization
    let pkeys = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM pg_constraint WHERE conname = 'citations_json_pkey'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(pkeys, 1);
}

#[tokio::test]
#[serial]
async fn test_load_state_machine() {
    let Some(pool) = test_pool().await else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    reset_database(&pool).await;
    let adapter = PostgresAdapter::from_pool(pool.clone());

    adapter.initialize_schema(LoadMode::Full).await.unwrap();

    // Transition on a missing row creates it first
    adapter
        .manage_load_state(
            "pubmed26n0001.xml.gz",
            LoadStatus::Downloading,
            StateUpdate {
                file_type: Some(FileType::Baseline),
                md5_checksum: Some("abc123".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!adapter.has_completed_baseline().await.unwrap());
    assert!(adapter.get_completed_files().await.unwrap().is_empty());

    adapter
        .manage_load_state(
            "pubmed26n0001.xml.gz",
            LoadStatus::Loading,
            StateUpdate::default(),
        )
        .await
        .unwrap();
    adapter
        .manage_load_state(
            "pubmed26n0001.xml.gz",
            LoadStatus::Complete,
            StateUpdate {
                records_processed: Some(42),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(adapter.has_completed_baseline().await.unwrap());
    assert_eq!(
        adapter.get_completed_files().await.unwrap(),
        vec!["pubmed26n0001.xml.gz".to_string()]
    );

    let history = adapter.get_load_history().await.unwrap();
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry.status, LoadStatus::Complete);
    assert_eq!(entry.file_type, "BASELINE");
    assert_eq!(entry.md5_checksum.as_deref(), Some("abc123"));
    assert_eq!(entry.records_processed, Some(42));
    assert!(entry.download_timestamp.is_some());
    assert!(entry.load_start_timestamp.is_some());
    assert!(entry.load_end_timestamp.is_some());

    // FAILED rows reset to PENDING; COMPLETE rows are untouched
    adapter
        .manage_load_state(
            "pubmed26n0002.xml.gz",
            LoadStatus::Failed,
            StateUpdate::default(),
        )
        .await
        .unwrap();
    assert_eq!(adapter.reset_failed_files().await.unwrap(), 1);

    let history = adapter.get_load_history().await.unwrap();
    let reset_entry = history
        .iter()
        .find(|entry| entry.file_name == "pubmed26n0002.xml.gz")
        .unwrap();
    assert_eq!(reset_entry.status, LoadStatus::Pending);
    // A row created without a known type defaults to UNKNOWN
    assert_eq!(reset_entry.file_type, "UNKNOWN");
    assert_eq!(
        adapter.get_completed_files().await.unwrap(),
        vec!["pubmed26n0001.xml.gz".to_string()]
    );
}
