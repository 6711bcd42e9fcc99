#![allow(dead_code)]

use std::path::Path;

use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt; // for `oneshot`
use uuid::Uuid;

use org_scope::create_app;

/// Fresh migrated database in a temp dir. Keep the `TempDir` alive for the test.
pub async fn database() -> Result<(TempDir, SqlitePool)> {
    let dir = tempdir().context("failed to create tempdir")?;
    let opts = SqliteConnectOptions::new()
        .filename(dir.path().join("test.db"))
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;

    let migrator = sqlx::migrate::Migrator::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")).await?;
    migrator.run(&pool).await?;

    Ok((dir, pool))
}

pub async fn app() -> Result<(TempDir, SqlitePool, Router)> {
    let (dir, pool) = database().await?;

    std::env::set_var("JWT_SECRET", "test-secret");
    std::env::set_var("ORG_SELF_SERVICE", "true");
    std::env::set_var("AUTHZ_PARITY", "strict");
    let app = create_app(pool.clone()).await?;

    Ok((dir, pool, app))
}

/// Sends one request and returns the status with the JSON body (`Null` when empty).
pub async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 10_485_760).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).with_context(|| format!("non-JSON body: {}", String::from_utf8_lossy(&bytes)))?
    };

    Ok((status, value))
}

pub struct Account {
    pub id: Uuid,
    pub token: String,
}

pub async fn register(app: &Router, name: &str, email: &str) -> Result<Account> {
    let (status, body) = send(
        app,
        "POST",
        "/auth/register",
        None,
        Some(serde_json::json!({ "name": name, "email": email, "password": "password123" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);

    Ok(Account {
        id: uuid_at(&body, "/user/id")?,
        token: body["token"].as_str().context("missing token")?.to_string(),
    })
}

pub fn uuid_at(value: &Value, pointer: &str) -> Result<Uuid> {
    let raw = value
        .pointer(pointer)
        .and_then(Value::as_str)
        .with_context(|| format!("missing {} in {}", pointer, value))?;
    Ok(Uuid::parse_str(raw)?)
}
