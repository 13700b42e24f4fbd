use std::time::Duration;

use claims::{assert_matches, assert_ok_eq, assert_some};
use common::{
    domain::entities::{
        document::{ClaimOutcome, DocumentEnrichment, DocumentMeta, NewDocument},
        document_status::DocumentStatus,
    },
    ports::document_repository::DocumentRepository,
    repositories::document_postgres_repository::DocumentPostgresRepository,
};

use crate::helpers::set_up_database;

fn new_document(author_id: Option<i64>) -> NewDocument {
    NewDocument::builder()
        .file_path("s3://documents/0b6a/report.txt".to_string())
        .doc_size(12)
        .author_id(author_id)
        .build()
}

fn processed() -> DocumentEnrichment {
    DocumentEnrichment {
        title: "Report".to_string(),
        content: "Report\nAll good.".to_string(),
        meta: DocumentMeta::from([("content_type".to_string(), "text/plain".to_string())]),
        status: DocumentStatus::Processed,
    }
}

// The tests below need a Postgres server listening on 127.0.0.1:5432

#[tokio::test]
#[ignore]
async fn an_inserted_document_is_a_draft_pointing_to_its_file() {
    let repository = DocumentPostgresRepository::new(set_up_database().await);

    let document = repository.insert(new_document(Some(7))).await.unwrap();

    assert_eq!(document.status, DocumentStatus::Draft);
    assert_eq!(document.file_path, "s3://documents/0b6a/report.txt");
    let stored = assert_some!(repository.get_by_id(document.id).await.unwrap());
    assert_eq!(stored.author_id, Some(7));
}

#[tokio::test]
#[ignore]
async fn only_one_of_two_claims_wins_and_only_its_commit_goes_through() {
    let repository = DocumentPostgresRepository::new(set_up_database().await);
    let document = repository.insert(new_document(None)).await.unwrap();

    let ClaimOutcome::Claimed(stale) = repository
        .try_claim(document.id, Duration::from_millis(100))
        .await
        .unwrap()
    else {
        panic!("the first claim should succeed");
    };
    assert_matches!(
        repository.try_claim(document.id, Duration::from_secs(60)).await.unwrap(),
        ClaimOutcome::InProgressElsewhere { .. }
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let ClaimOutcome::Claimed(fresh) = repository
        .try_claim(document.id, Duration::from_secs(60))
        .await
        .unwrap()
    else {
        panic!("an expired claim should be taken over");
    };

    assert_ok_eq!(repository.renew_claim(&stale, Duration::from_secs(60)).await, false);
    assert_ok_eq!(repository.commit_enrichment(&stale, &processed()).await, false);
    assert_ok_eq!(repository.commit_enrichment(&fresh, &processed()).await, true);

    let stored = assert_some!(repository.get_by_id(document.id).await.unwrap());
    assert_eq!(stored.status, DocumentStatus::Processed);
    assert_eq!(stored.meta["content_type"], "text/plain");
    assert_matches!(
        repository.try_claim(document.id, Duration::from_secs(60)).await.unwrap(),
        ClaimOutcome::AlreadySettled(DocumentStatus::Processed)
    );
}

#[tokio::test]
#[ignore]
async fn a_renewed_claim_outlives_its_first_lease() {
    let repository = DocumentPostgresRepository::new(set_up_database().await);
    let document = repository.insert(new_document(None)).await.unwrap();
    let ClaimOutcome::Claimed(claim) = repository
        .try_claim(document.id, Duration::from_millis(200))
        .await
        .unwrap()
    else {
        panic!("the claim should succeed");
    };

    assert_ok_eq!(repository.renew_claim(&claim, Duration::from_secs(60)).await, true);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_matches!(
        repository.try_claim(document.id, Duration::from_secs(60)).await.unwrap(),
        ClaimOutcome::InProgressElsewhere { .. }
    );
}

#[tokio::test]
#[ignore]
async fn unknown_and_settled_documents_are_not_claimed_nor_failed() {
    let repository = DocumentPostgresRepository::new(set_up_database().await);
    let document = repository.insert(new_document(None)).await.unwrap();

    assert_eq!(
        repository.try_claim(404, Duration::from_secs(60)).await.unwrap(),
        ClaimOutcome::NotFound
    );
    assert_ok_eq!(repository.mark_failed(document.id, "missing file").await, true);
    assert_ok_eq!(repository.mark_failed(document.id, "again").await, false);
    assert_matches!(
        repository.try_claim(document.id, Duration::from_secs(60)).await.unwrap(),
        ClaimOutcome::AlreadySettled(DocumentStatus::Failed)
    );
}

#[tokio::test]
#[ignore]
async fn listing_filters_by_author_most_recent_first() {
    let repository = DocumentPostgresRepository::new(set_up_database().await);
    for author_id in [Some(1), Some(2), Some(1)] {
        repository.insert(new_document(author_id)).await.unwrap();
    }

    let by_author = repository.list(Some(1), 10).await.unwrap();

    assert_eq!(by_author.len(), 2);
    assert!(by_author[0].id > by_author[1].id);
    assert_eq!(repository.list(None, 2).await.unwrap().len(), 2);
}
