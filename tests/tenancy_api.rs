mod common;

use anyhow::Result;
use axum::http::StatusCode;
use axum::Router;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use common::{register, send, uuid_at, Account};

/// Acme: alice owns it, bob administers it, carol and sam are members.
/// P1 has carol as viewer and sam as supplier PM; P2 has no members.
struct Acme {
    _dir: TempDir,
    _pool: SqlitePool,
    app: Router,
    org: Uuid,
    p1: Uuid,
    p2: Uuid,
    alice: Account,
    bob: Account,
    carol: Account,
    sam: Account,
    erin: Account,
    dave: Account,
}

async fn add_org_member(app: &Router, owner: &Account, org: Uuid, user: &Account, role: &str) -> Result<()> {
    let (status, body) = send(
        app,
        "POST",
        &format!("/organisations/{}/members", org),
        Some(&owner.token),
        Some(json!({ "user_id": user.id, "org_role": role })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "add org member failed: {}", body);
    Ok(())
}

async fn add_project_member(
    app: &Router,
    caller: &Account,
    org: Uuid,
    project: Uuid,
    user: &Account,
    role: &str,
) -> Result<(StatusCode, Value)> {
    send(
        app,
        "POST",
        &format!("/organisations/{}/projects/{}/members", org, project),
        Some(&caller.token),
        Some(json!({ "user_id": user.id, "project_role": role })),
    )
    .await
}

async fn create_project(app: &Router, caller: &Account, org: Uuid, name: &str, reference: &str) -> Result<Uuid> {
    let (status, body) = send(
        app,
        "POST",
        &format!("/organisations/{}/projects", org),
        Some(&caller.token),
        Some(json!({ "name": name, "reference": reference })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "project create failed: {}", body);
    uuid_at(&body, "/id")
}

async fn acme() -> Result<Acme> {
    let (dir, pool, app) = common::app().await?;

    let alice = register(&app, "Alice", "alice@acme.test").await?;
    let bob = register(&app, "Bob", "bob@acme.test").await?;
    let carol = register(&app, "Carol", "carol@acme.test").await?;
    let sam = register(&app, "Sam", "sam@acme.test").await?;
    let erin = register(&app, "Erin", "erin@acme.test").await?;
    let dave = register(&app, "Dave", "dave@elsewhere.test").await?;

    let (status, body) = send(&app, "POST", "/organisations", Some(&alice.token), Some(json!({ "name": "Acme" }))).await?;
    assert_eq!(status, StatusCode::CREATED, "org create failed: {}", body);
    let org = uuid_at(&body, "/id")?;

    add_org_member(&app, &alice, org, &bob, "admin").await?;
    add_org_member(&app, &alice, org, &carol, "member").await?;
    add_org_member(&app, &alice, org, &sam, "member").await?;
    add_org_member(&app, &alice, org, &erin, "member").await?;

    let p1 = create_project(&app, &alice, org, "Pilot", "P1").await?;
    let p2 = create_project(&app, &bob, org, "Rollout", "P2").await?;

    let (status, body) = add_project_member(&app, &alice, org, p1, &carol, "viewer").await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let (status, body) = add_project_member(&app, &alice, org, p1, &sam, "supplier_pm").await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    Ok(Acme { _dir: dir, _pool: pool, app, org, p1, p2, alice, bob, carol, sam, erin, dave })
}

async fn decide(app: &Router, caller: &Account, org: Uuid, project: Option<Uuid>, access: Value) -> Result<String> {
    let (status, body) = send(
        app,
        "POST",
        "/access/decide",
        Some(&caller.token),
        Some(json!({ "organisation_id": org, "project_id": project, "access": access })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "decide failed: {}", body);
    Ok(body["decision"].as_str().unwrap_or_default().to_string())
}

fn project_ids(body: &Value) -> Vec<Uuid> {
    body.as_array()
        .map(|items| items.iter().filter_map(|p| uuid_at(p, "/id").ok()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn org_admins_list_every_project_members_only_their_own() -> Result<()> {
    let acme = acme().await?;
    let uri = format!("/organisations/{}/projects", acme.org);

    let (status, body) = send(&acme.app, "GET", &uri, Some(&acme.bob.token), None).await?;
    assert_eq!(status, StatusCode::OK);
    let listed = project_ids(&body);
    assert!(listed.contains(&acme.p1) && listed.contains(&acme.p2), "bob sees {:?}", listed);

    let (status, body) = send(&acme.app, "GET", &uri, Some(&acme.carol.token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(project_ids(&body), vec![acme.p1]);

    let (status, body) = send(&acme.app, "GET", &uri, Some(&acme.erin.token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(project_ids(&body).is_empty());

    Ok(())
}

#[tokio::test]
async fn project_data_needs_project_membership() -> Result<()> {
    let acme = acme().await?;
    let milestones_view = json!({ "scope": "project", "resource": "milestones", "action": "view" });
    let milestones_edit = json!({ "scope": "project", "resource": "milestones", "action": "edit" });

    // org admin without a project role sees the project but not its data
    assert_eq!(decide(&acme.app, &acme.bob, acme.org, Some(acme.p1), json!({ "scope": "project_visibility" })).await?, "allow");
    assert_eq!(decide(&acme.app, &acme.bob, acme.org, Some(acme.p1), milestones_view.clone()).await?, "deny");

    assert_eq!(decide(&acme.app, &acme.carol, acme.org, Some(acme.p1), milestones_view.clone()).await?, "allow");
    assert_eq!(decide(&acme.app, &acme.carol, acme.org, Some(acme.p1), milestones_edit).await?, "deny");
    assert_eq!(decide(&acme.app, &acme.carol, acme.org, Some(acme.p2), milestones_view.clone()).await?, "deny");

    // project id paired with the wrong organisation
    let (status, body) = send(&acme.app, "POST", "/organisations", Some(&acme.carol.token), Some(json!({ "name": "Carol Co" }))).await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let carol_co = uuid_at(&body, "/id")?;
    assert_eq!(decide(&acme.app, &acme.carol, carol_co, Some(acme.p1), milestones_view).await?, "deny");

    Ok(())
}

#[tokio::test]
async fn outsiders_get_not_found_on_reads_and_forbidden_on_writes() -> Result<()> {
    let acme = acme().await?;

    let (status, _) = send(&acme.app, "GET", &format!("/organisations/{}", acme.org), Some(&acme.dave.token), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &acme.app,
        "GET",
        &format!("/organisations/{}/projects/{}", acme.org, acme.p1),
        Some(&acme.dave.token),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &acme.app,
        "GET",
        &format!("/organisations/{}/projects/{}", acme.org, acme.p2),
        Some(&acme.carol.token),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &acme.app,
        "POST",
        &format!("/organisations/{}/members", acme.org),
        Some(&acme.carol.token),
        Some(json!({ "user_id": acme.dave.id, "org_role": "member" })),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    Ok(())
}

#[tokio::test]
async fn roster_writes_respect_prerequisite_and_subsumption() -> Result<()> {
    let acme = acme().await?;

    // dave is not in the organisation
    let (status, _) = add_project_member(&acme.app, &acme.alice, acme.org, acme.p1, &acme.dave, "viewer").await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // adding and removing people is for project admins and organisation admins
    let (status, _) = add_project_member(&acme.app, &acme.sam, acme.org, acme.p1, &acme.erin, "contributor").await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = add_project_member(&acme.app, &acme.alice, acme.org, acme.p1, &acme.erin, "admin").await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    // a supplier PM may not demote or remove a project admin
    let erin_uri = format!("/organisations/{}/projects/{}/members/{}", acme.org, acme.p1, acme.erin.id);
    let (status, body) = send(&acme.app, "PUT", &erin_uri, Some(&acme.sam.token), Some(json!({ "project_role": "viewer" }))).await?;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);
    let (status, _) = send(&acme.app, "DELETE", &erin_uri, Some(&acme.sam.token), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&acme.app, "PUT", &erin_uri, Some(&acme.bob.token), Some(json!({ "project_role": "contributor" }))).await?;
    assert_eq!(status, StatusCode::OK, "{}", body);

    // but may move people below them, never above their own role
    let (status, body) = send(&acme.app, "PUT", &erin_uri, Some(&acme.sam.token), Some(json!({ "project_role": "viewer" }))).await?;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["project_role"], "viewer");
    let (status, _) = send(&acme.app, "PUT", &erin_uri, Some(&acme.sam.token), Some(json!({ "project_role": "admin" }))).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // viewers cannot touch the roster
    let (status, _) = add_project_member(&acme.app, &acme.carol, acme.org, acme.p2, &acme.erin, "viewer").await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    Ok(())
}

#[tokio::test]
async fn last_owner_cannot_leave_or_be_demoted() -> Result<()> {
    let acme = acme().await?;
    let member_uri = format!("/organisations/{}/members/{}", acme.org, acme.alice.id);

    let (status, _) = send(&acme.app, "DELETE", &member_uri, Some(&acme.alice.token), None).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&acme.app, "PUT", &member_uri, Some(&acme.alice.token), Some(json!({ "org_role": "admin" }))).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    // an admin may not touch an owner at all
    let (status, _) = send(&acme.app, "DELETE", &member_uri, Some(&acme.bob.token), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    Ok(())
}

#[tokio::test]
async fn removal_from_organisation_cascades_to_projects() -> Result<()> {
    let acme = acme().await?;

    let (status, _) = send(
        &acme.app,
        "DELETE",
        &format!("/organisations/{}/members/{}", acme.org, acme.carol.id),
        Some(&acme.bob.token),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let milestones_view = json!({ "scope": "project", "resource": "milestones", "action": "view" });
    assert_eq!(decide(&acme.app, &acme.carol, acme.org, Some(acme.p1), milestones_view).await?, "deny");

    let (status, body) = send(
        &acme.app,
        "GET",
        &format!("/organisations/{}/projects/{}/members", acme.org, acme.p1),
        Some(&acme.alice.token),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let roster: Vec<Uuid> = body
        .as_array()
        .map(|rows| rows.iter().filter_map(|r| uuid_at(r, "/user_id").ok()).collect())
        .unwrap_or_default();
    assert!(!roster.contains(&acme.carol.id), "carol still on roster: {}", body);

    Ok(())
}

#[tokio::test]
async fn context_prefers_member_projects_then_falls_back_for_admins() -> Result<()> {
    let acme = acme().await?;

    let (status, carol) = send(&acme.app, "GET", "/context", Some(&acme.carol.token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(carol["status"], "ready");
    assert_eq!(uuid_at(&carol, "/organisation_id")?, acme.org);
    assert_eq!(uuid_at(&carol, "/project_id")?, acme.p1);
    assert_eq!(carol["project_role"], "viewer");

    let (_, bob) = send(&acme.app, "GET", "/context", Some(&acme.bob.token), None).await?;
    assert_eq!(bob["status"], "ready");
    assert!(bob["project_id"].is_string(), "admin fallback picks a project: {}", bob);
    assert!(bob["project_role"].is_null());

    let (_, dave) = send(&acme.app, "GET", "/context", Some(&acme.dave.token), None).await?;
    assert_eq!(dave["status"], "no_access");

    Ok(())
}

async fn organisation_count(app: &Router, caller: &Account) -> Result<usize> {
    let (status, me) = send(app, "GET", "/auth/me", Some(&caller.token), None).await?;
    assert_eq!(status, StatusCode::OK, "{}", me);
    Ok(me["organisations"].as_array().map(Vec::len).unwrap_or_default())
}

#[tokio::test]
async fn deleted_organisation_drops_out_of_every_member_context() -> Result<()> {
    let acme = acme().await?;

    let (_, before) = send(&acme.app, "GET", "/context", Some(&acme.carol.token), None).await?;
    assert_eq!(before["status"], "ready");
    assert_eq!(organisation_count(&acme.app, &acme.carol).await?, 1);

    let (status, _) = send(&acme.app, "DELETE", &format!("/organisations/{}", acme.org), Some(&acme.alice.token), None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, after) = send(&acme.app, "GET", "/context", Some(&acme.carol.token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["status"], "no_access", "{}", after);
    assert!(after["organisation_id"].is_null());
    assert_eq!(organisation_count(&acme.app, &acme.carol).await?, 0);

    Ok(())
}

#[tokio::test]
async fn deactivated_organisation_drops_out_of_every_member_context() -> Result<()> {
    let acme = acme().await?;

    let (_, before) = send(&acme.app, "GET", "/context", Some(&acme.bob.token), None).await?;
    assert_eq!(before["status"], "ready");
    assert_eq!(organisation_count(&acme.app, &acme.bob).await?, 1);

    let (status, body) = send(
        &acme.app,
        "PUT",
        &format!("/organisations/{}", acme.org),
        Some(&acme.alice.token),
        Some(json!({ "is_active": false })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (_, after) = send(&acme.app, "GET", "/context", Some(&acme.bob.token), None).await?;
    assert_eq!(after["status"], "no_access", "{}", after);
    assert_eq!(organisation_count(&acme.app, &acme.bob).await?, 0);

    Ok(())
}

#[tokio::test]
async fn organisation_switch_clears_project_and_overlay() -> Result<()> {
    let acme = acme().await?;
    let token = Some(acme.alice.token.as_str());

    let (_, body) = send(&acme.app, "PUT", "/context/view-as", token, Some(json!({ "org_role": "member" }))).await?;
    assert_eq!(body["applied"], true, "{}", body);

    let (status, body) = send(&acme.app, "POST", "/organisations", token, Some(json!({ "name": "Beta" }))).await?;
    assert_eq!(status, StatusCode::CREATED);
    let beta = uuid_at(&body, "/id")?;

    let (status, snapshot) = send(&acme.app, "PUT", "/context/organisation", token, Some(json!({ "organisation_id": beta }))).await?;
    assert_eq!(status, StatusCode::OK, "{}", snapshot);
    assert_eq!(uuid_at(&snapshot, "/organisation_id")?, beta);
    assert!(snapshot["project_id"].is_null());
    assert!(snapshot["overlay"]["org_role"].is_null());

    // not a member: rejected, previous selection kept
    let (status, _) = send(
        &acme.app,
        "PUT",
        "/context/organisation",
        token,
        Some(json!({ "organisation_id": Uuid::new_v4() })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, snapshot) = send(&acme.app, "GET", "/context", token, None).await?;
    assert_eq!(uuid_at(&snapshot, "/organisation_id")?, beta);

    Ok(())
}

#[tokio::test]
async fn organisation_switch_reselects_inside_the_new_organisation() -> Result<()> {
    let acme = acme().await?;

    let (status, body) = send(&acme.app, "POST", "/organisations", Some(&acme.alice.token), Some(json!({ "name": "Globex" }))).await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let globex = uuid_at(&body, "/id")?;
    add_org_member(&acme.app, &acme.alice, globex, &acme.carol, "member").await?;
    let g1 = create_project(&acme.app, &acme.alice, globex, "Grid", "G1").await?;
    let (status, body) = add_project_member(&acme.app, &acme.alice, globex, g1, &acme.carol, "contributor").await?;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    let (_, before) = send(&acme.app, "GET", "/context", Some(&acme.carol.token), None).await?;
    assert_eq!(uuid_at(&before, "/organisation_id")?, acme.org);
    assert_eq!(uuid_at(&before, "/project_id")?, acme.p1);

    let (status, switched) = send(
        &acme.app,
        "PUT",
        "/context/organisation",
        Some(&acme.carol.token),
        Some(json!({ "organisation_id": globex })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "{}", switched);
    assert_eq!(uuid_at(&switched, "/organisation_id")?, globex);
    assert_eq!(uuid_at(&switched, "/project_id")?, g1);
    assert_eq!(switched["project_role"], "contributor");

    let (_, current) = send(&acme.app, "GET", "/context", Some(&acme.carol.token), None).await?;
    assert_eq!(uuid_at(&current, "/project_id")?, g1);

    Ok(())
}

#[tokio::test]
async fn view_as_never_escalates() -> Result<()> {
    let acme = acme().await?;

    // admin asking to preview owner
    let (status, body) = send(&acme.app, "PUT", "/context/view-as", Some(&acme.bob.token), Some(json!({ "org_role": "owner" }))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], false);
    assert!(body["overlay"]["org_role"].is_null());

    // viewers cannot preview at all
    let (_, body) = send(
        &acme.app,
        "PUT",
        "/context/view-as",
        Some(&acme.carol.token),
        Some(json!({ "project_role": "viewer" })),
    )
    .await?;
    assert_eq!(body["applied"], false);

    Ok(())
}

#[tokio::test]
async fn capabilities_intersect_real_and_previewed_roles() -> Result<()> {
    let acme = acme().await?;
    let token = Some(acme.alice.token.as_str());

    let (_, caps) = send(&acme.app, "GET", "/access/capabilities", token, None).await?;
    assert_eq!(caps["impersonating"], false);
    assert_eq!(caps["can_view_project"], true);

    let (_, body) = send(&acme.app, "PUT", "/context/view-as", token, Some(json!({ "org_role": "member" }))).await?;
    assert_eq!(body["applied"], true, "{}", body);

    let (status, caps) = send(&acme.app, "GET", "/access/capabilities", token, None).await?;
    assert_eq!(status, StatusCode::OK, "{}", caps);
    assert_eq!(caps["impersonating"], true);
    assert_eq!(caps["can_view_project"], false);

    let members = caps["organisation"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["resource"] == "members"))
        .cloned()
        .unwrap_or(Value::Null);
    assert_eq!(members["actions"], json!(["view"]));
    assert!(caps["organisation"]
        .as_array()
        .is_some_and(|rows| rows.iter().all(|r| r["resource"] != "settings")));

    // the overlay never reaches enforcement
    let settings_edit = json!({ "scope": "org", "resource": "settings", "action": "edit" });
    assert_eq!(decide(&acme.app, &acme.alice, acme.org, None, settings_edit).await?, "allow");

    let (_, body) = send(&acme.app, "DELETE", "/context/view-as", token, None).await?;
    assert!(body["overlay"]["org_role"].is_null());

    Ok(())
}

#[tokio::test]
async fn logout_revokes_the_session() -> Result<()> {
    let acme = acme().await?;
    let token = Some(acme.erin.token.as_str());

    let (status, _) = send(&acme.app, "GET", "/auth/me", token, None).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&acme.app, "POST", "/auth/logout", token, None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&acme.app, "GET", "/auth/me", token, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    Ok(())
}
