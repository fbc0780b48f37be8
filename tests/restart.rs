mod common;

use rust_decimal_macros::dec;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;

use common::{network_error, open_service, simplified, Fixture, ScriptedClient};
use einvoice_engine::models::InvoiceHash;
use einvoice_engine::{ComplianceError, Invoice, QueueStatus, SubmissionOutcome};

#[tokio::test]
async fn chain_resumes_from_the_last_stored_invoice() {
    let fixture = Fixture::new();

    let last = {
        let service = fixture.open(ScriptedClient::accepting()).await;
        service.issue(simplified(dec!(1), dec!(10.00))).await.unwrap();
        service.issue(simplified(dec!(1), dec!(20.00))).await.unwrap().invoice
    };

    let service = fixture.open(ScriptedClient::accepting()).await;
    let tail = service.chain_tail().await;
    assert_eq!(tail.icv, 2);
    assert_eq!(tail.last_hash, last.content_hash);

    let next = service.issue(simplified(dec!(1), dec!(30.00))).await.unwrap().invoice;
    assert_eq!(next.icv, 3);
    assert_eq!(next.pih, last.content_hash);
}

#[tokio::test]
async fn queued_entries_survive_a_restart() {
    let fixture = Fixture::new();

    let queued = {
        let service = fixture.open(ScriptedClient::new(vec![network_error()])).await;
        let issued = service.issue(simplified(dec!(2), dec!(100.00))).await.unwrap();
        assert!(matches!(issued.submission, SubmissionOutcome::Queued { .. }));
        issued.invoice
    };

    let client = ScriptedClient::accepting();
    let service = fixture.open(client.clone()).await;
    let entries = service.queue().entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, QueueStatus::Pending);
    assert_eq!(entries[0].invoice.uuid(), queued.uuid());
    assert_eq!(entries[0].invoice.content_hash, queued.content_hash);

    let report = service.drain_queue().await.unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(client.calls(), vec![queued.uuid()]);
}

#[tokio::test]
async fn interrupted_submission_is_picked_up_again() {
    let fixture = Fixture::new();
    let service = fixture.open(ScriptedClient::new(vec![network_error()])).await;
    service.issue(simplified(dec!(1), dec!(1.00))).await.unwrap();
    drop(service);

    // a crash mid-submission leaves the entry in flight
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&fixture.settings.database_url)
        .await
        .unwrap();
    sqlx::query("UPDATE offline_queue SET status = 'processing'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let service = fixture.open(ScriptedClient::accepting()).await;
    let entries = service.queue().entries().await.unwrap();
    assert_eq!(entries[0].status, QueueStatus::Pending);
}

#[tokio::test]
async fn new_key_starts_a_new_chain() {
    let fixture = Fixture::new();
    {
        let service = fixture.open(ScriptedClient::accepting()).await;
        service.issue(simplified(dec!(1), dec!(10.00))).await.unwrap();
        service.issue(simplified(dec!(1), dec!(10.00))).await.unwrap();
    }

    let rotated = open_service(fixture.with_new_key(), ScriptedClient::accepting()).await;
    let first = rotated.issue(simplified(dec!(1), dec!(10.00))).await.unwrap().invoice;

    assert_eq!(first.icv, 1);
    assert_eq!(first.pih, InvoiceHash::genesis());

    // the original key still continues its own chain
    let original = fixture.open(ScriptedClient::accepting()).await;
    assert_eq!(original.chain_tail().await.icv, 2);
    assert_ne!(original.chain_id(), rotated.chain_id());
}

#[tokio::test]
async fn tampered_store_halts_issuance_until_resumed() {
    let fixture = Fixture::new();
    {
        let service = fixture.open(ScriptedClient::accepting()).await;
        service.issue(simplified(dec!(1), dec!(10.00))).await.unwrap();
        service.issue(simplified(dec!(1), dec!(20.00))).await.unwrap();
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&fixture.settings.database_url)
        .await
        .unwrap();
    let row = sqlx::query("SELECT uuid, body FROM invoices WHERE icv = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    let uuid: String = row.get("uuid");
    let mut invoice: Invoice = serde_json::from_str(row.get::<&str, _>("body")).unwrap();
    invoice.canonical.lines[0].description = "Forged line".to_string();
    sqlx::query("UPDATE invoices SET body = ?1 WHERE uuid = ?2")
        .bind(serde_json::to_string(&invoice).unwrap())
        .bind(uuid)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let service = fixture.open(ScriptedClient::accepting()).await;
    assert!(service.chain_halted().await.is_some());

    let err = service.issue(simplified(dec!(1), dec!(5.00))).await.unwrap_err();
    assert!(matches!(err, ComplianceError::ChainIntegrity(_)));

    let tail = service.resume_chain().await;
    assert_eq!(tail.icv, 2);
    let next = service.issue(simplified(dec!(1), dec!(5.00))).await.unwrap().invoice;
    assert_eq!(next.icv, 3);
}

#[tokio::test]
async fn second_writer_on_the_same_chain_halts_issuance() {
    let fixture = Fixture::new();
    let a = fixture.open(ScriptedClient::accepting()).await;
    let b = fixture.open(ScriptedClient::accepting()).await;

    a.issue(simplified(dec!(1), dec!(10.00))).await.unwrap();

    let err = b.issue(simplified(dec!(1), dec!(20.00))).await.unwrap_err();
    assert!(matches!(err, ComplianceError::ChainIntegrity(_)));
    assert!(b.chain_halted().await.is_some());
    assert!(b.chain_tail().await.is_genesis());

    let err = b.issue(simplified(dec!(1), dec!(30.00))).await.unwrap_err();
    assert!(matches!(err, ComplianceError::ChainIntegrity(ref reason) if reason.contains("halted")));

    // the writer that owns the tail carries on
    assert!(a.chain_halted().await.is_none());
    assert_eq!(a.issue(simplified(dec!(1), dec!(40.00))).await.unwrap().invoice.icv, 2);
}
