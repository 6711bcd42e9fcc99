mod common;

use anyhow::Result;
use axum::http::StatusCode;

#[tokio::test]
async fn health_endpoint_reports_db_and_grants() -> Result<()> {
    let (_dir, _pool, app) = common::app().await?;

    let (status, body) = common::send(&app, "GET", "/api/health", None, None).await?;
    assert_eq!(status, StatusCode::OK, "health endpoint did not return 200");
    assert_eq!(body["db_ok"], true, "expected db_ok: true, got: {}", body);
    // grant tables are materialised at startup
    assert!(body["org_grants"].as_i64().unwrap_or(0) > 0, "no grants synced: {}", body);
    assert_eq!(body["authz_parity"], "strict");

    Ok(())
}
