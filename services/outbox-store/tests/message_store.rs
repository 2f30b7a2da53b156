//! Integration tests for the Message Store
//!
//! Exercises the store through its public API only:
//! - Ordering across shard rollover with HELD and BROKEN records mixed in
//! - Deletion of acknowledged records
//! - Payload round trip through disk
//! - Accepted-type changes
//! - Crash between temp write and rename
//! - Restart with durable metadata, including right after a deletion

use outbox_store::clock::FixedClock;
use outbox_store::config::{StoreConfig, DEFAULT_API};
use outbox_store::layout::RecordFlags;
use outbox_store::metadata::{JsonFileMetadata, MemoryMetadata};
use outbox_store::store::MessageStore;
use outbox_types::message::{Message, Value};
use outbox_types::schema::{FieldSchema, MessageSchema, SchemaRegistry};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn schemas() -> SchemaRegistry {
    [
        MessageSchema::new("data").field("n", FieldSchema::Int),
        MessageSchema::new("hold-me").field("n", FieldSchema::Int),
        MessageSchema::new("blob").field("payload", FieldSchema::Any),
        MessageSchema::new("disk-info")
            .field(
                "mounts",
                FieldSchema::list(FieldSchema::record([
                    ("device", FieldSchema::Unicode),
                    ("free", FieldSchema::Float),
                ])),
            )
            .optional("label", FieldSchema::Unicode),
    ]
    .into_iter()
    .collect()
}

fn open(dir: &Path, capacity: usize) -> MessageStore {
    let config = StoreConfig {
        shard_capacity: capacity,
        sync_writes: false,
        ..StoreConfig::new(dir)
    };
    let mut store = MessageStore::with_clock(
        config,
        Box::new(MemoryMetadata::new()),
        Arc::new(FixedClock::new(0)),
    )
    .unwrap()
    .with_schemas(schemas());
    store
        .set_accepted_types(["data", "blob", "disk-info"])
        .unwrap();
    store
}

fn numbers(messages: &[Message]) -> Vec<i64> {
    messages
        .iter()
        .filter_map(|m| m.get("n").and_then(Value::as_int))
        .collect()
}

/// Steps applied to a fresh store before checking delivery order.
#[derive(Debug, Clone)]
enum Step {
    Accepted,
    Held,
    Corrupt,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => Just(Step::Accepted),
        2 => Just(Step::Held),
        1 => Just(Step::Corrupt),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_pending_order_matches_insertion(
        steps in prop::collection::vec(step(), 0..40),
        capacity in 1usize..6,
    ) {
        let tmp = TempDir::new().unwrap();
        let mut store = open(tmp.path(), capacity);

        let mut expected = Vec::new();
        for (n, step) in steps.iter().enumerate() {
            let n = n as i64;
            match step {
                Step::Accepted => {
                    store.add(Message::new("data").with("n", n)).unwrap();
                    expected.push(n);
                }
                Step::Held => {
                    store.add(Message::new("hold-me").with("n", n)).unwrap();
                }
                Step::Corrupt => {
                    store.add(Message::new("data").with("n", n)).unwrap();
                    let last = store.list_records().unwrap().pop().unwrap();
                    fs::write(&last.path, b"\x00\x00").unwrap();
                }
            }
        }

        let pending = store.get_pending(None).unwrap();
        prop_assert_eq!(numbers(&pending), expected.clone());

        // Keys of delivered records are strictly increasing.
        let keys: Vec<_> = store
            .get_pending_records(None)
            .unwrap()
            .iter()
            .map(|r| r.key)
            .collect();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));

        // Quarantined and held records are still on disk.
        prop_assert_eq!(store.list_records().unwrap().len(), steps.len());
    }

    #[test]
    fn prop_delete_drops_exactly_the_acknowledged(
        count in 0usize..30,
        offset_frac in 0.0f64..=1.0,
        capacity in 1usize..5,
    ) {
        let tmp = TempDir::new().unwrap();
        let mut store = open(tmp.path(), capacity);
        for n in 0..count {
            store.add(Message::new("data").with("n", n as i64)).unwrap();
        }
        let offset = (count as f64 * offset_frac) as u64;
        store.set_pending_offset(offset);

        store.delete_old_messages().unwrap();
        let remaining = numbers(&store.get_pending(None).unwrap());
        let expected: Vec<i64> = (offset as i64..count as i64).collect();
        prop_assert_eq!(remaining, expected);
    }
}

fn value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
        "[a-z0-9 ]{0,12}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_payload_survives_disk(payload in value()) {
        let tmp = TempDir::new().unwrap();
        let mut store = open(tmp.path(), 1000);

        let message = Message::new("blob").with("payload", payload);
        store.add(message.clone()).unwrap();

        let expected = message.with("api", DEFAULT_API);
        let pending = store.get_pending(None).unwrap();
        prop_assert_eq!(pending, vec![expected]);
    }
}

#[test]
fn test_coerced_form_is_stored() {
    let tmp = TempDir::new().unwrap();
    let mut store = open(tmp.path(), 1000);

    let mount: BTreeMap<String, Value> = [
        ("device".to_string(), Value::Bytes(b"/dev/sda1".to_vec())),
        ("free".to_string(), Value::Int(1024)),
    ]
    .into_iter()
    .collect();
    let message = Message::new("disk-info")
        .with("mounts", vec![Value::Map(mount)])
        .with("timestamp", 17i64);
    store.add(message).unwrap();

    let pending = store.get_pending(None).unwrap();
    let Some(Value::List(mounts)) = pending[0].get("mounts") else {
        panic!("mounts missing");
    };
    let Value::Map(mount) = &mounts[0] else {
        panic!("mount is not a map");
    };
    assert_eq!(mount.get("device"), Some(&Value::Str("/dev/sda1".into())));
    assert_eq!(mount.get("free"), Some(&Value::Float(1024.0)));
    assert_eq!(pending[0].get("timestamp"), Some(&Value::Float(17.0)));
}

#[test]
fn test_accepted_type_changes_never_touch_sent_records() {
    let tmp = TempDir::new().unwrap();
    let mut store = open(tmp.path(), 3);
    for n in 0..4i64 {
        store.add(Message::new("data").with("n", n)).unwrap();
    }
    store.add(Message::new("hold-me").with("n", 4i64)).unwrap();
    store.set_pending_offset(2);

    // Dropping "data" holds only the unsent ones.
    store.set_accepted_types(["blob"]).unwrap();
    let flags: Vec<RecordFlags> = store
        .list_records()
        .unwrap()
        .iter()
        .map(|r| r.flags)
        .collect();
    assert_eq!(
        flags,
        vec![
            RecordFlags::NONE,
            RecordFlags::NONE,
            RecordFlags::HELD,
            RecordFlags::HELD,
            RecordFlags::HELD,
        ]
    );
    assert!(store.get_pending(None).unwrap().is_empty());

    // Accepting "data" again leaves "hold-me" held.
    store.set_accepted_types(["data"]).unwrap();
    assert_eq!(numbers(&store.get_pending(None).unwrap()), vec![2, 3]);
    let held: Vec<bool> = store
        .list_records()
        .unwrap()
        .iter()
        .map(|r| r.flags.held)
        .collect();
    assert_eq!(held.iter().filter(|h| **h).count(), 1);
    assert_eq!(store.get_pending_offset(), 2);
}

#[test]
fn test_is_pending_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let mut store = open(tmp.path(), 1000);
    let id = store.add(Message::new("data").with("n", 1i64)).unwrap();
    assert!(store.is_pending(id).unwrap());

    store.got_next_expected(1).unwrap();
    assert!(!store.is_pending(id).unwrap());

    store.delete_old_messages().unwrap();
    assert!(!store.is_pending(id).unwrap());
    assert!(store.list_records().unwrap().is_empty());
}

#[test]
fn test_crash_before_rename_is_invisible() {
    let tmp = TempDir::new().unwrap();
    let mut store = open(tmp.path(), 1000);
    store.add(Message::new("data").with("n", 0i64)).unwrap();
    let before = store.list_records().unwrap();

    // A write that died between the temp file and the rename.
    let shard = tmp.path().join("0");
    fs::write(shard.join("1.tmp"), b"half a reco").unwrap();

    assert_eq!(store.list_records().unwrap(), before);
    assert_eq!(numbers(&store.get_pending(None).unwrap()), vec![0]);
    assert_eq!(store.count_pending().unwrap(), 1);

    // The next add still lands after the surviving record.
    store.add(Message::new("data").with("n", 2i64)).unwrap();
    assert_eq!(numbers(&store.get_pending(None).unwrap()), vec![0, 2]);
}

#[test]
fn test_restart_with_durable_metadata() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("messages");
    let meta_path = tmp.path().join("broker.json");

    let config = StoreConfig {
        shard_capacity: 2,
        ..StoreConfig::new(&dir)
    };
    {
        let metadata = JsonFileMetadata::open(&meta_path).unwrap();
        let mut store = MessageStore::open(config.clone(), Box::new(metadata))
            .unwrap()
            .with_schemas(schemas());
        store.set_accepted_types(["data"]).unwrap();
        for n in 0..5i64 {
            store.add(Message::new("data").with("n", n)).unwrap();
        }
        store.got_next_expected(3).unwrap();
        store.commit().unwrap();

        // Not committed, lost on restart.
        store.set_pending_offset(5);
    }

    let metadata = JsonFileMetadata::open(&meta_path).unwrap();
    let mut store = MessageStore::open(config, Box::new(metadata))
        .unwrap()
        .with_schemas(schemas());
    assert_eq!(store.get_sequence(), 3);
    assert_eq!(store.get_pending_offset(), 3);
    assert_eq!(store.get_accepted_types(), vec!["data"]);
    assert_eq!(numbers(&store.get_pending(None).unwrap()), vec![3, 4]);
}

#[test]
fn test_crash_after_delete_keeps_unsent_records() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("messages");
    let meta_path = tmp.path().join("broker.json");
    let config = StoreConfig {
        shard_capacity: 2,
        ..StoreConfig::new(&dir)
    };
    {
        let metadata = JsonFileMetadata::open(&meta_path).unwrap();
        let mut store = MessageStore::open(config.clone(), Box::new(metadata))
            .unwrap()
            .with_schemas(schemas());
        store.set_accepted_types(["data"]).unwrap();
        for n in 0..6i64 {
            store.add(Message::new("data").with("n", n)).unwrap();
        }
        store.got_next_expected(3).unwrap();
        store.commit().unwrap();

        assert_eq!(store.delete_old_messages().unwrap(), 3);
        // Dropped without a commit, as if the process died here.
    }

    let metadata = JsonFileMetadata::open(&meta_path).unwrap();
    let mut store = MessageStore::open(config, Box::new(metadata))
        .unwrap()
        .with_schemas(schemas());
    assert_eq!(store.get_pending_offset(), 0);
    assert_eq!(store.get_sequence(), 3);
    assert_eq!(numbers(&store.get_pending(None).unwrap()), vec![3, 4, 5]);
}

#[test]
fn test_broken_record_is_diagnosable() {
    let tmp = TempDir::new().unwrap();
    let mut store = open(tmp.path(), 1000);
    store.add(Message::new("data").with("n", 0i64)).unwrap();
    let entry = store.list_records().unwrap().remove(0);
    let mut bytes = fs::read(&entry.path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&entry.path, bytes).unwrap();

    let report = store.read_record(entry.key).unwrap().unwrap();
    assert!(report.decoded.is_err());

    assert!(store.get_pending(None).unwrap().is_empty());
    let quarantined = store.list_records().unwrap().remove(0);
    assert!(quarantined.flags.broken);
    assert!(quarantined.path.to_string_lossy().ends_with("0_b"));
}
