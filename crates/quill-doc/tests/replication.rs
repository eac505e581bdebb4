use proptest::prelude::*;
use quill_core::{FieldSchema, IdGenerator, Role, Schema, ValueType};
use quill_doc::{CreateResult, Document, DocumentConfig, DocumentEvent, FieldValue, MergeEvent};
use quill_proto::SignedOp;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

fn schema() -> Schema {
    Schema::new()
        .with_field("title", FieldSchema::register().with_initial(json!("Untitled")))
        .with_field("body", FieldSchema::text().with_initial(json!("hi")))
        .with_field(
            "items",
            FieldSchema::array(ValueType::Number).with_initial(json!([1, 2, 3])),
        )
        .with_field("tags", FieldSchema::set(ValueType::String))
        .with_field("meta", FieldSchema::map(ValueType::Any))
        .with_field("props", FieldSchema::record(ValueType::Any))
}

async fn open(created: &CreateResult, actor: &str, role: Option<Role>) -> Document {
    let key = role.and_then(|r| created.role_keys.private_for(r).cloned());
    Document::load(schema(), actor, key, created.snapshot.clone())
        .await
        .unwrap()
}

/// Owner plus one editor replica per name, all caught up.
async fn team(editors: &[&str]) -> (CreateResult, Document, Vec<Document>) {
    let created = Document::create(&schema(), "alice").await.unwrap();
    let mut alice = open(&created, "alice", Some(Role::Owner)).await;
    for name in editors {
        alice.acl().set_role(name, Role::Editor).unwrap();
    }
    alice.flush_and_merge().await;

    let mut replicas = Vec::new();
    for name in editors {
        let mut replica = open(&created, name, Some(Role::Editor)).await;
        let outcome = replica.merge(alice.op_log()).await;
        assert_eq!(outcome.rejected, 0);
        replicas.push(replica);
    }
    (created, alice, replicas)
}

fn items(doc: &Document) -> Vec<serde_json::Value> {
    match doc.value("items").unwrap() {
        FieldValue::Array(items) => items,
        other => panic!("unexpected value {other:?}"),
    }
}

#[tokio::test]
async fn replicas_converge_after_exchanging_ops() {
    let (_, mut alice, mut editors) = team(&["bob"]).await;
    let bob = &mut editors[0];

    alice.array("items").unwrap().push(json!(4)).unwrap();
    alice.text("body").unwrap().push_str(" there").unwrap();
    alice.map("meta").unwrap().set(json!({"k": 1}), json!("v")).unwrap();
    alice.flush_and_merge().await;

    bob.set("tags").unwrap().add(json!("draft")).unwrap();
    bob.record("props").unwrap().set("lang", json!("en")).unwrap();
    bob.register("title").unwrap().set(json!("Plan")).unwrap();
    bob.flush_and_merge().await;

    bob.merge(alice.op_log()).await;
    alice.merge(bob.op_log()).await;

    assert_eq!(alice.values(), bob.values());
    assert_eq!(items(&alice), vec![json!(1), json!(2), json!(3), json!(4)]);
    assert_eq!(bob.text("body").unwrap().text(), "hi there");
    assert!(alice.set("tags").unwrap().has(&json!("draft")));
    assert_eq!(bob.map("meta").unwrap().get(&json!({"k": 1})), Some(json!("v")));
    assert_eq!(alice.record("props").unwrap().get("lang"), Some(json!("en")));
    assert_eq!(alice.value("title").unwrap().to_json(), json!("Plan"));
}

#[tokio::test]
async fn merge_is_idempotent() {
    let (_, mut alice, mut editors) = team(&["bob"]).await;
    let bob = &mut editors[0];

    alice.array("items").unwrap().set_at(0, json!(10)).unwrap();
    alice.flush_and_merge().await;
    let ops = alice.op_log().to_vec();

    let mut events = bob.subscribe();
    let first = bob.merge(&ops).await;
    assert_eq!(first.rejected, 0);
    let state = bob.values();
    let mut seen = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DocumentEvent::Merge(_)) {
            seen += 1;
        }
    }
    assert!(seen > 0);

    let second = bob.merge(&ops).await;
    assert_eq!(second.accepted.len(), ops.len());
    assert_eq!(second.rejected, 0);
    assert_eq!(bob.values(), state);
    assert!(events.try_recv().is_err());
    assert_eq!(bob.op_log().len(), ops.len());
}

#[tokio::test]
async fn remote_array_changes_emit_list_events() {
    let (_, mut alice, mut editors) = team(&["bob"]).await;
    let bob = &mut editors[0];

    alice.array("items").unwrap().push(json!(4)).unwrap();
    alice.flush_and_merge().await;
    alice.array("items").unwrap().shift().unwrap();
    alice.flush_and_merge().await;

    let mut events = bob.subscribe();
    bob.merge(alice.op_log()).await;

    let mut merges = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DocumentEvent::Merge(event) = event {
            merges.push(event);
        }
    }
    assert_eq!(
        merges,
        vec![
            MergeEvent {
                actor: "alice".to_string(),
                target: "items".to_string(),
                method: "push",
                data: json!({ "value": 4 }),
            },
            MergeEvent {
                actor: "alice".to_string(),
                target: "items".to_string(),
                method: "shift",
                data: serde_json::Value::Null,
            },
        ]
    );
}

#[tokio::test]
async fn concurrent_editors_converge() {
    let (_, mut alice, mut editors) = team(&["bob", "carol", "dave"]).await;

    editors[0].array("items").unwrap().push(json!(4)).unwrap();
    editors[1].array("items").unwrap().shift().unwrap();
    editors[2].array("items").unwrap().set_at(1, json!(20)).unwrap();
    for editor in &mut editors {
        editor.flush_and_merge().await;
    }

    let logs: Vec<Vec<SignedOp>> = editors.iter().map(|e| e.op_log().to_vec()).collect();

    // Each replica hears from the others in a different order
    editors[0].merge(&logs[1]).await;
    editors[0].merge(&logs[2]).await;
    editors[1].merge(&logs[2]).await;
    editors[1].merge(&logs[0]).await;
    let both: Vec<SignedOp> = logs[0].iter().chain(&logs[1]).cloned().collect();
    editors[2].merge(&both).await;
    for log in logs.iter().rev() {
        alice.merge(log).await;
    }

    let expected = vec![json!(20), json!(3), json!(4)];
    assert_eq!(items(&alice), expected);
    for editor in &editors {
        assert_eq!(items(editor), expected);
        assert_eq!(editor.values(), alice.values());
    }
}

/// Ids that sort below every time-ordered id.
#[derive(Debug, Default)]
struct LowIds(AtomicU32);

impl IdGenerator for LowIds {
    fn next_id(&self) -> String {
        format!("!{:08}", self.0.fetch_add(1, Ordering::SeqCst))
    }
}

#[tokio::test]
async fn map_and_record_writes_replace_what_they_saw() {
    let created = Document::create(&schema(), "alice").await.unwrap();
    let mut alice = open(&created, "alice", Some(Role::Owner)).await;
    alice.acl().set_role("bob", Role::Editor).unwrap();
    alice.map("meta").unwrap().set(json!("k"), json!("old")).unwrap();
    alice.record("props").unwrap().set("lang", json!("en")).unwrap();
    alice.flush_and_merge().await;

    let key = created.role_keys.private_for(Role::Editor).cloned();
    let config = DocumentConfig::default().with_ids(Arc::new(LowIds::default()));
    let mut bob = Document::load_with(schema(), "bob", key, created.snapshot.clone(), config)
        .await
        .unwrap();
    assert_eq!(bob.merge(alice.op_log()).await.rejected, 0);

    bob.map("meta").unwrap().set(json!("k"), json!("new")).unwrap();
    bob.record("props").unwrap().set("lang", json!("fr")).unwrap();
    bob.flush_and_merge().await;
    alice.merge(bob.op_log()).await;

    for doc in [&mut alice, &mut bob] {
        assert_eq!(doc.map("meta").unwrap().get(&json!("k")), Some(json!("new")));
        assert_eq!(doc.record("props").unwrap().get("lang"), Some(json!("fr")));
        assert_eq!(doc.map("meta").unwrap().len(), 1);
    }
    assert_eq!(alice.values(), bob.values());
}

#[tokio::test]
async fn concurrent_map_writes_converge() {
    let (_, mut alice, mut editors) = team(&["bob", "carol"]).await;

    editors[0].map("meta").unwrap().set(json!("k"), json!("bob")).unwrap();
    editors[1].map("meta").unwrap().set(json!("k"), json!("carol")).unwrap();
    editors[0].record("props").unwrap().set("p", json!(1)).unwrap();
    editors[1].record("props").unwrap().delete("p").unwrap();
    for editor in &mut editors {
        editor.flush_and_merge().await;
    }

    let logs: Vec<Vec<SignedOp>> = editors.iter().map(|e| e.op_log().to_vec()).collect();
    editors[0].merge(&logs[1]).await;
    editors[1].merge(&logs[0]).await;
    alice.merge(&logs[1]).await;
    alice.merge(&logs[0]).await;

    let winner = alice.map("meta").unwrap().get(&json!("k"));
    assert!(winner.is_some());
    assert_eq!(alice.record("props").unwrap().get("p"), Some(json!(1)));
    for editor in &mut editors {
        assert_eq!(editor.map("meta").unwrap().get(&json!("k")), winner);
        assert_eq!(editor.values(), alice.values());
    }
}

struct Fixture {
    created: CreateResult,
    ops: Vec<SignedOp>,
    expected: std::collections::BTreeMap<String, FieldValue>,
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (created, mut alice, mut editors) = team(&["bob", "carol"]).await;

            editors[0].array("items").unwrap().insert_at(1, json!(7)).unwrap();
            editors[0].set("tags").unwrap().add(json!("a")).unwrap();
            editors[1].array("items").unwrap().delete_at(2).unwrap();
            editors[1].set("tags").unwrap().add(json!("a")).unwrap();
            editors[1].text("body").unwrap().insert_at(0, "oh ").unwrap();
            alice.register("title").unwrap().set(json!("Final")).unwrap();
            alice.record("props").unwrap().set("k", json!(1)).unwrap();

            alice.flush_and_merge().await;
            for editor in &mut editors {
                editor.flush_and_merge().await;
                alice.merge(editor.op_log()).await;
            }

            Fixture {
                created,
                ops: alice.op_log().to_vec(),
                expected: alice.values(),
            }
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn permuted_batches_converge(order in Just((0..fixture().ops.len()).collect::<Vec<_>>()).prop_shuffle()) {
        let fixture = fixture();
        let batch: Vec<SignedOp> = order.iter().map(|&i| fixture.ops[i].clone()).collect();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (rejected, values) = runtime.block_on(async {
            // Read-only replica of the owner: no key, full read access
            let mut replica = open(&fixture.created, "alice", None).await;
            let outcome = replica.merge(&batch).await;
            (outcome.rejected, replica.values())
        });

        prop_assert_eq!(rejected, 0);
        prop_assert_eq!(&values, &fixture.expected);
    }
}
