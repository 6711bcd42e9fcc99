mod common;

use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use serde_json::json;
use sqlx::SqlitePool;

use common::{register, send, uuid_at};
use org_scope::events::verify_chain;

async fn wait_for(pool: &SqlitePool, event_name: &str) -> Result<i64> {
    for _ in 0..50 {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE event_name = ?")
            .bind(event_name)
            .fetch_one(pool)
            .await?;
        if count > 0 {
            return Ok(count);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(0)
}

#[tokio::test]
async fn membership_and_view_as_changes_are_chained() -> Result<()> {
    let (_dir, pool, app) = common::app().await?;

    let alice = register(&app, "Alice", "alice@audit.test").await?;
    let bob = register(&app, "Bob", "bob@audit.test").await?;

    let (status, body) = send(&app, "POST", "/organisations", Some(&alice.token), Some(json!({ "name": "Audited" }))).await?;
    assert_eq!(status, StatusCode::CREATED);
    let org = uuid_at(&body, "/id")?;

    let (status, _) = send(
        &app,
        "POST",
        &format!("/organisations/{}/members", org),
        Some(&alice.token),
        Some(json!({ "user_id": bob.id, "org_role": "admin" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = send(&app, "PUT", "/context/view-as", Some(&alice.token), Some(json!({ "org_role": "admin" }))).await?;
    assert_eq!(body["applied"], true, "{}", body);
    // served under the overlay
    send(&app, "GET", "/auth/me", Some(&alice.token), None).await?;

    let (_, body) = send(&app, "PUT", "/context/view-as", Some(&bob.token), Some(json!({ "org_role": "owner" }))).await?;
    assert_eq!(body["applied"], false);

    assert!(wait_for(&pool, "organisation.created").await? > 0);
    assert!(wait_for(&pool, "organisation_member.added").await? >= 2);
    assert!(wait_for(&pool, "impersonation.set").await? > 0);
    assert!(wait_for(&pool, "impersonation.access").await? > 0);
    assert!(wait_for(&pool, "impersonation.rejected").await? > 0);

    let severity: String = sqlx::query_scalar("SELECT severity FROM audit_log WHERE event_name = 'organisation_member.added' LIMIT 1")
        .fetch_one(&pool)
        .await?;
    assert_eq!(severity, "critical");

    assert_eq!(verify_chain(&pool).await?, None, "audit chain broken");

    Ok(())
}

#[tokio::test]
async fn tampering_breaks_the_chain() -> Result<()> {
    let (_dir, pool, app) = common::app().await?;

    let alice = register(&app, "Alice", "alice@tamper.test").await?;
    send(&app, "POST", "/organisations", Some(&alice.token), Some(json!({ "name": "First" }))).await?;
    send(&app, "POST", "/organisations", Some(&alice.token), Some(json!({ "name": "Second" }))).await?;
    assert!(wait_for(&pool, "organisation.created").await? > 0);
    for _ in 0..50 {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log").fetch_one(&pool).await?;
        if count >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    sqlx::query("UPDATE audit_log SET payload = '{}' WHERE seq = 2").execute(&pool).await?;
    assert_eq!(verify_chain(&pool).await?, Some(2));

    Ok(())
}
