use quill_core::hlc::current_time_ms;
use quill_core::{FieldSchema, OpKind, Role, Schema, Timestamp, ValueType};
use quill_doc::{CreateResult, DocError, Document, DocumentEvent, FieldValue};
use quill_proto::{sign_token, Ed25519Signer, Jwk, OpPayload, SignedOp, Signer, TokenHeader, TOKEN_TYP};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

fn schema() -> Schema {
    Schema::new()
        .with_field(
            "title",
            FieldSchema::register()
                .with_type(ValueType::String)
                .with_regex("^[A-Za-z ]+$")
                .unwrap()
                .with_initial(json!("Untitled")),
        )
        .with_field("body", FieldSchema::text().with_initial(json!("hi")))
        .with_field("items", FieldSchema::array(ValueType::Number))
}

async fn open(created: &CreateResult, actor: &str, role: Option<Role>) -> Document {
    let key = role.and_then(|r| created.role_keys.private_for(r).cloned());
    Document::load(schema(), actor, key, created.snapshot.clone())
        .await
        .unwrap()
}

async fn owner() -> (CreateResult, Document) {
    let created = Document::create(&schema(), "alice").await.unwrap();
    let alice = open(&created, "alice", Some(Role::Owner)).await;
    (created, alice)
}

/// Grant `role` to `actor` from `granter` and open the actor's replica.
async fn admit(
    created: &CreateResult,
    granter: &mut Document,
    actor: &str,
    role: Role,
) -> Document {
    granter.acl().set_role(actor, role).unwrap();
    granter.flush_and_merge().await;
    let mut replica = open(created, actor, Some(role)).await;
    replica.merge(granter.op_log()).await;
    replica
}

/// Sign an op by hand, stamped a minute in the future.
async fn forge(
    doc: &Document,
    key: &Jwk,
    iss: &str,
    role: Role,
    kind: OpKind,
    field: Option<&str>,
    patch: Value,
) -> SignedOp {
    let signer = Ed25519Signer;
    let header = TokenHeader {
        alg: signer.algorithm().to_string(),
        typ: TOKEN_TYP.to_string(),
        kid: Some(format!("{iss}:{role}")),
    };
    let payload = OpPayload {
        iss: iss.to_string(),
        sub: doc.doc_id().to_string(),
        iat: 0,
        stamp: Timestamp::new(current_time_ms() + 60_000, 0, iss),
        kind,
        schema: doc.schema_id().to_string(),
        field: field.map(String::from),
        patch,
    };
    SignedOp::from(sign_token(&signer, key, &header, &payload).await.unwrap())
}

#[tokio::test]
async fn regex_register_rejects_bad_values_locally() {
    let (_, mut alice) = owner().await;

    let err = assert_err!(alice.register("title").unwrap().set(json!("Bad!")));
    assert!(matches!(err, DocError::Validation(_)));
    assert_err!(alice.register("title").unwrap().set(json!(42)));

    assert_ok!(alice.register("title").unwrap().set(json!("Good title")));
    alice.flush_and_merge().await;
    assert_eq!(alice.register("title").unwrap().get(), Some(json!("Good title")));
}

#[tokio::test]
async fn regex_register_rejects_bad_initial_value() {
    let bad = Schema::new().with_field(
        "title",
        FieldSchema::register()
            .with_regex("^[a-z]+$")
            .unwrap()
            .with_initial(json!("NOPE")),
    );
    let err = assert_err!(Document::create(&bad, "alice").await);
    assert!(matches!(err, DocError::Validation(_)));
}

#[tokio::test]
async fn regex_register_rejects_bad_values_remotely() {
    let (created, mut alice) = owner().await;
    let bob = admit(&created, &mut alice, "bob", Role::Editor).await;
    let editor_key = created.role_keys.private_for(Role::Editor).unwrap();

    let bad = forge(
        &bob,
        editor_key,
        "bob",
        Role::Editor,
        OpKind::RegisterSet,
        Some("title"),
        json!({ "value": "Bad!" }),
    )
    .await;
    let outcome = alice.merge(&[bad]).await;
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected, 1);
    assert_eq!(alice.value("title").unwrap(), FieldValue::Register(Some(json!("Untitled"))));

    let good = forge(
        &bob,
        editor_key,
        "bob",
        Role::Editor,
        OpKind::RegisterSet,
        Some("title"),
        json!({ "value": "Fine" }),
    )
    .await;
    assert_eq!(alice.merge(&[good]).await.accepted.len(), 1);
    assert_eq!(alice.value("title").unwrap(), FieldValue::Register(Some(json!("Fine"))));
}

#[tokio::test]
async fn revoked_editor_falls_back_to_initial_values() {
    let (created, mut alice) = owner().await;
    let mut bob = admit(&created, &mut alice, "bob", Role::Editor).await;
    assert_eq!(bob.role(), Role::Editor);

    bob.register("title").unwrap().set(json!("Bob title")).unwrap();
    bob.text("body").unwrap().push_str(" there").unwrap();
    bob.flush_and_merge().await;
    alice.merge(bob.op_log()).await;
    assert_eq!(alice.value("title").unwrap(), FieldValue::Register(Some(json!("Bob title"))));
    assert_eq!(bob.value("body").unwrap(), FieldValue::Text("hi there".to_string()));

    let mut events = bob.subscribe();
    alice.acl().set_role("bob", Role::Revoked).unwrap();
    alice.flush_and_merge().await;
    assert_eq!(alice.acl().get_role("bob"), Role::Revoked);

    let outcome = bob.merge(alice.op_log()).await;
    assert_eq!(outcome.rejected, 0);
    assert!(bob.is_revoked());

    let revoked = loop {
        match events.try_recv().unwrap() {
            DocumentEvent::Revoked(event) => break event,
            _ => continue,
        }
    };
    assert_eq!(revoked.actor_id, "bob");
    assert_eq!(revoked.previous, Role::Editor);
    assert_eq!(revoked.by, "alice");

    assert_eq!(bob.value("title").unwrap(), FieldValue::Register(Some(json!("Untitled"))));
    assert_eq!(bob.value("body").unwrap(), FieldValue::Text("hi".to_string()));
    assert!(matches!(bob.snapshot(), Err(DocError::Unauthorized { .. })));

    let err = assert_err!(bob.register("title").unwrap().set(json!("Still here")));
    assert!(matches!(err, DocError::Unauthorized { role: Role::Revoked, .. }));

    // The owner keeps the full history
    assert_eq!(alice.value("title").unwrap(), FieldValue::Register(Some(json!("Bob title"))));
}

#[tokio::test]
async fn manager_cannot_grant_manager() {
    let (created, mut alice) = owner().await;
    let mut carol = admit(&created, &mut alice, "carol", Role::Manager).await;

    let err = assert_err!(carol.acl().set_role("dave", Role::Manager));
    assert!(matches!(err, DocError::Unauthorized { role: Role::Manager, .. }));
    assert_ok!(carol.acl().set_role("dave", Role::Editor));
    carol.flush_and_merge().await;
    assert_eq!(carol.acl().get_role("dave"), Role::Editor);

    let manager_key = created.role_keys.private_for(Role::Manager).unwrap();
    let escalation = forge(
        &carol,
        manager_key,
        "carol",
        Role::Manager,
        OpKind::AclSet,
        None,
        json!({ "id": "grant-escalation", "target": "mallory", "role": "manager" }),
    )
    .await;

    let mut fresh = Document::load(schema(), "erin", None, alice.snapshot().unwrap())
        .await
        .unwrap();
    let outcome = fresh.merge(&[escalation]).await;
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected, 1);
    assert_eq!(fresh.acl().get_role("mallory"), Role::Revoked);
    assert!(!fresh.acl().known_actors().contains(&"mallory".to_string()));
}

#[tokio::test]
async fn viewers_cannot_write() {
    let (created, mut alice) = owner().await;
    let mut vic = admit(&created, &mut alice, "vic", Role::Viewer).await;
    assert_eq!(vic.role(), Role::Viewer);

    let err = assert_err!(vic.array("items").unwrap().push(json!(1)));
    assert!(matches!(err, DocError::Unauthorized { role: Role::Viewer, .. }));
    let err = assert_err!(vic.ack());
    assert!(matches!(err, DocError::Unauthorized { .. }));
}

#[tokio::test]
async fn tampered_tokens_are_rejected() {
    let (created, mut alice) = owner().await;
    let mut fresh = admit(&created, &mut alice, "erin", Role::Viewer).await;
    let before = fresh.values();

    alice.register("title").unwrap().set(json!("First")).unwrap();
    alice.register("title").unwrap().set(json!("Second")).unwrap();
    let written = alice.flush_and_merge().await.accepted;
    assert_eq!(written.len(), 2);

    let parts: Vec<&str> = written[0].token.split('.').collect();
    let mut payload: Vec<char> = parts[1].chars().collect();
    let middle = payload.len() / 2;
    payload[middle] = if payload[middle] == 'A' { 'B' } else { 'A' };
    let flipped = SignedOp::from(format!(
        "{}.{}.{}",
        parts[0],
        payload.into_iter().collect::<String>(),
        parts[2]
    ));

    let other: Vec<&str> = written[1].token.split('.').collect();
    let swapped = SignedOp::from(format!("{}.{}.{}", parts[0], other[1], parts[2]));

    for tampered in [flipped, swapped] {
        let outcome = fresh.merge(&[tampered]).await;
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected, 1);
        assert_eq!(fresh.values(), before);
    }

    let outcome = fresh.merge(&written).await;
    assert_eq!(outcome.accepted.len(), 2);
    assert_eq!(fresh.value("title").unwrap(), FieldValue::Register(Some(json!("Second"))));
}

#[tokio::test]
async fn ops_for_other_documents_are_rejected() {
    let (_, mut alice) = owner().await;
    let (_, other) = owner().await;

    let outcome = alice.merge(other.op_log()).await;
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected, other.op_log().len());
}

#[tokio::test]
async fn snapshot_with_invalid_ops_fails_to_load() {
    let (created, _) = owner().await;
    let mut snapshot = created.snapshot.clone();
    snapshot.ops.push(SignedOp::from("not.a.token".to_string()));

    let err = assert_err!(Document::load(schema(), "erin", None, snapshot).await);
    assert!(matches!(err, DocError::InvalidSnapshot { rejected: 1 }));
}

#[tokio::test]
async fn ops_for_another_schema_are_rejected() {
    let (created, mut alice) = owner().await;
    let bob = admit(&created, &mut alice, "bob", Role::Editor).await;
    let editor_key = created.role_keys.private_for(Role::Editor).unwrap();

    let signer = Ed25519Signer;
    let header = TokenHeader {
        alg: signer.algorithm().to_string(),
        typ: TOKEN_TYP.to_string(),
        kid: Some("bob:editor".to_string()),
    };
    let payload = OpPayload {
        iss: "bob".to_string(),
        sub: bob.doc_id().to_string(),
        iat: 0,
        stamp: Timestamp::new(current_time_ms() + 60_000, 0, "bob"),
        kind: OpKind::RegisterSet,
        schema: "some-other-schema".to_string(),
        field: Some("title".to_string()),
        patch: json!({ "value": "Replayed" }),
    };
    let replayed = SignedOp::from(sign_token(&signer, editor_key, &header, &payload).await.unwrap());

    let outcome = alice.merge(&[replayed]).await;
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected, 1);
    assert_eq!(alice.value("title").unwrap(), FieldValue::Register(Some(json!("Untitled"))));

    // A replica opened with a different schema cannot replay the log
    let other = schema().with_field("extra", FieldSchema::text());
    let err = assert_err!(Document::load(other, "erin", None, alice.snapshot().unwrap()).await);
    assert!(matches!(err, DocError::InvalidSnapshot { .. }));
}

#[tokio::test]
async fn reused_grant_ids_with_other_contents_are_rejected() {
    let (created, alice) = owner().await;
    let owner_key = created.role_keys.private_for(Role::Owner).unwrap();

    let first = forge(
        &alice,
        owner_key,
        "alice",
        Role::Owner,
        OpKind::AclSet,
        None,
        json!({ "id": "grant-dave", "target": "dave", "role": "editor" }),
    )
    .await;
    let reused = forge(
        &alice,
        owner_key,
        "alice",
        Role::Owner,
        OpKind::AclSet,
        None,
        json!({ "id": "grant-dave", "target": "dave", "role": "manager" }),
    )
    .await;

    let mut fresh = Document::load(schema(), "erin", None, created.snapshot.clone())
        .await
        .unwrap();
    assert_eq!(fresh.merge(&[first.clone()]).await.accepted.len(), 1);

    let outcome = fresh.merge(&[reused]).await;
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected, 1);
    assert_eq!(fresh.acl().get_role("dave"), Role::Editor);

    // The same token again is still a no-op accept
    assert_eq!(fresh.merge(&[first]).await.accepted.len(), 1);
}
