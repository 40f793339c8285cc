//! End-to-end room behavior over recording transports.
//!
//! These tests drive a `Room` the way the WebSocket server does and check
//! what every participant observed, and in which order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use liveroom::hooks::{HookError, HookFuture, RoomHooks, SessionSummary};
use liveroom::protocol::{ClientMsg, CreateOp, CrdtType, Op, OpKind, ServerMsg, TARGET_EVERYONE};
use liveroom::room::LEASED_SESSION_SCOPE;
use liveroom::session::{CloseReason, RecordingTransport, TicketOptions};
use liveroom::storage::position;
use liveroom::{Driver, ManualClock, MemoryDriver, Room, RoomConfig, RoomError, SystemClock};
use serde_json::{json, Value};

fn memory_room() -> Room {
    Room::new("room", Arc::new(MemoryDriver::new()), RoomConfig::for_testing())
}

async fn join(room: &Room, version: u32) -> (String, Arc<RecordingTransport>) {
    join_as(room, None, version).await
}

async fn join_as(room: &Room, actor: Option<i64>, version: u32) -> (String, Arc<RecordingTransport>) {
    let ticket = room
        .create_ticket(TicketOptions {
            actor,
            version,
            ..TicketOptions::default()
        })
        .unwrap();
    let key = ticket.session_key().to_string();
    let transport = RecordingTransport::new();
    room.start_browser_session(ticket, transport.clone()).await.unwrap();
    (key, transport)
}

fn actor_of(transport: &RecordingTransport) -> i64 {
    match transport.messages().first() {
        Some(ServerMsg::RoomState { actor, .. }) => *actor,
        other => panic!("expected ROOM_STATE first, got {other:?}"),
    }
}

fn create(op_id: &str, id: &str, crdt_type: CrdtType, parent: &str, key: &str) -> Op {
    Op::new(
        Some(op_id.into()),
        OpKind::Create(CreateOp {
            id: id.into(),
            crdt_type,
            parent_id: parent.into(),
            parent_key: key.into(),
            data: None,
            intent_set: false,
            deleted_id: None,
        }),
    )
}

fn storage(ops: Vec<Op>) -> Vec<ClientMsg> {
    vec![ClientMsg::UpdateStorage { ops }]
}

fn object(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ─── Storage fan-out ──────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_list_insert_gets_position_fix() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key_a, a) = join(&room, 8).await;
    let (key_b, b) = join(&room, 8).await;

    room.process_client_msgs(&key_a, storage(vec![create("a:0", "list", CrdtType::List, "root", "items")]))
        .await
        .unwrap();
    let pos = position::first();
    room.process_client_msgs(&key_a, storage(vec![create("a:1", "x", CrdtType::Map, "list", &pos)]))
        .await
        .unwrap();
    a.drain();
    b.drain();

    // Same position, no "set" intent: the server moves it
    room.process_client_msgs(&key_b, storage(vec![create("b:0", "y", CrdtType::Map, "list", &pos)]))
        .await
        .unwrap();

    let to_author = b.drain();
    let ServerMsg::UpdateStorage { ops } = &to_author[0] else {
        panic!("expected UPDATE_STORAGE, got {to_author:?}");
    };
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[1].op_id.as_deref(), Some("b:0"));
    let OpKind::SetParentKey { id, parent_key } = &ops[1].kind else {
        panic!("expected a SET_PARENT_KEY fix, got {:?}", ops[1]);
    };
    assert_eq!(id, "y");
    assert!(parent_key.as_str() > pos.as_str());

    let to_other = a.drain();
    let ServerMsg::UpdateStorage { ops } = &to_other[0] else {
        panic!("expected UPDATE_STORAGE, got {to_other:?}");
    };
    assert!(ops.iter().all(|op| op.op_id.is_none()));
    assert_eq!(ops.len(), 2);

    let rows = room.storage_rows().await.unwrap();
    let keys: Vec<_> = rows
        .iter()
        .filter(|(_, c)| c.parent_id.as_deref() == Some("list"))
        .map(|(_, c)| c.parent_key.clone().unwrap())
        .collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_register_under_object_rejected_only_to_author() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key_a, a) = join(&room, 8).await;
    let (_, b) = join(&room, 8).await;
    a.drain();
    b.drain();

    room.process_client_msgs(&key_a, storage(vec![create("a:0", "r", CrdtType::Register, "root", "k")]))
        .await
        .unwrap();

    let msgs = a.drain();
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], ServerMsg::RejectStorageOp { op_ids, .. } if op_ids == &vec!["a:0".to_string()]));
    assert!(b.drain().is_empty());
    assert_eq!(room.storage_rows().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_root_is_ignored() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key, t) = join(&room, 8).await;
    t.drain();

    room.process_client_msgs(
        &key,
        storage(vec![Op::new(Some("a:0".into()), OpKind::DeleteCrdt { id: "root".into() })]),
    )
    .await
    .unwrap();
    assert_eq!(t.drain(), vec![ServerMsg::UpdateStorage { ops: vec![Op::ack("a:0")] }]);
    assert_eq!(room.storage_rows().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_write_rejects_and_leaves_no_trace() {
    let driver = Arc::new(MemoryDriver::new());
    let room = Room::new("room", driver.clone(), RoomConfig::for_testing());
    room.load().await.unwrap();
    let (key_a, a) = join(&room, 8).await;
    let (_, b) = join(&room, 8).await;
    a.drain();
    b.drain();

    driver.set_failing_writes(true);
    room.process_client_msgs(&key_a, storage(vec![create("a:0", "m", CrdtType::Map, "root", "k")]))
        .await
        .unwrap();

    let msgs = a.drain();
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], ServerMsg::RejectStorageOp { op_ids, .. } if op_ids == &vec!["a:0".to_string()]));
    assert!(b.drain().is_empty());
    assert_eq!(room.storage_rows().await.unwrap().len(), 1);
    assert_eq!(driver.load_nodes("room").unwrap().len(), 1);

    // The same op goes through once the disk recovers
    driver.set_failing_writes(false);
    room.process_client_msgs(&key_a, storage(vec![create("a:1", "m", CrdtType::Map, "root", "k")]))
        .await
        .unwrap();
    assert_eq!(room.storage_rows().await.unwrap().len(), 2);
    assert_eq!(b.drain().len(), 1);
}

#[tokio::test]
async fn test_concurrent_batches_all_apply() {
    let room = Arc::new(memory_room());
    room.load().await.unwrap();
    let mut keys = Vec::new();
    for _ in 0..4 {
        keys.push(join(&room, 8).await.0);
    }

    let mut handles = Vec::new();
    for (n, key) in keys.into_iter().enumerate() {
        let room = room.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..20 {
                let id = format!("{n}:{i}");
                room.process_client_msgs(&key, storage(vec![create(&id, &id, CrdtType::Map, "root", &id)]))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(room.storage_rows().await.unwrap().len(), 81);
    assert_eq!(room.pending(), 0);
}

/// Three writers racing for the same map slot, the same LIST position and
/// the same root field.
fn contended_batch(writer: usize) -> Vec<ClientMsg> {
    let tag = format!("w{writer}");
    storage(vec![
        create(&format!("{tag}:0"), &format!("{tag}:map"), CrdtType::Map, "root", "slot"),
        create(&format!("{tag}:1"), &format!("{tag}:item"), CrdtType::Map, "list", &position::first()),
        Op::new(
            Some(format!("{tag}:2")),
            OpKind::UpdateObject {
                id: "root".into(),
                data: object(json!({ "title": tag })),
            },
        ),
    ])
}

async fn contended_room() -> (Arc<Room>, Vec<String>) {
    let room = Arc::new(memory_room());
    room.load().await.unwrap();
    let (setup, _) = join(&room, 8).await;
    room.process_client_msgs(&setup, storage(vec![create("s:0", "list", CrdtType::List, "root", "items")]))
        .await
        .unwrap();
    let mut keys = Vec::new();
    for _ in 0..3 {
        keys.push(join(&room, 8).await.0);
    }
    (room, keys)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_batches_are_serializable() {
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    // Every serial order, applied one batch at a time
    let mut serial = Vec::new();
    for order in orders {
        let (room, keys) = contended_room().await;
        for writer in order {
            room.process_client_msgs(&keys[writer], contended_batch(writer)).await.unwrap();
        }
        let rows = room.storage_rows().await.unwrap();

        // The last writer owns the contested slot and field
        let last = format!("w{}", order[2]);
        let slot = rows.iter().find(|(_, c)| c.parent_key.as_deref() == Some("slot")).unwrap();
        assert_eq!(slot.0, format!("{last}:map"));
        let root = &rows[0].1;
        assert_eq!(root.data.as_ref().unwrap()["title"], json!(last));
        // Every LIST insert survived at its own position
        let mut positions: Vec<_> = rows
            .iter()
            .filter(|(_, c)| c.parent_id.as_deref() == Some("list"))
            .map(|(_, c)| c.parent_key.clone().unwrap())
            .collect();
        positions.sort();
        positions.dedup();
        assert_eq!(positions.len(), 3);
        serial.push(rows);
    }

    // Racing batches must land on one of those outcomes
    for _ in 0..20 {
        let (room, keys) = contended_room().await;
        let mut handles = Vec::new();
        for (writer, key) in keys.into_iter().enumerate() {
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                room.process_client_msgs(&key, contended_batch(writer)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let rows = room.storage_rows().await.unwrap();
        assert!(serial.contains(&rows), "not a serial outcome: {rows:?}");
    }
}

// ─── Storage fetch ────────────────────────────────────────────────────

async fn room_with_600_nodes() -> (Room, String) {
    let room = memory_room();
    room.load().await.unwrap();
    let (key, _) = join(&room, 8).await;
    let ops = (0..599)
        .map(|i| {
            let id = format!("1:{i}");
            create(&id, &id, CrdtType::Map, "root", &format!("k{i:03}"))
        })
        .collect();
    room.process_client_msgs(&key, storage(ops)).await.unwrap();
    (room, key)
}

#[tokio::test]
async fn test_fetch_storage_streams_chunks() {
    let (room, _) = room_with_600_nodes().await;
    let (key, t) = join(&room, 8).await;
    t.drain();

    room.process_client_msgs(&key, vec![ClientMsg::FetchStorage]).await.unwrap();
    let msgs = t.drain();
    let sizes: Vec<usize> = msgs
        .iter()
        .filter_map(|m| match m {
            ServerMsg::StorageChunk { nodes } => Some(nodes.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![250, 250, 100]);
    assert_eq!(msgs.last(), Some(&ServerMsg::StorageStreamEnd));
    assert_eq!(msgs.len(), 4);

    // Root first
    let ServerMsg::StorageChunk { nodes } = &msgs[0] else { unreachable!() };
    assert_eq!(nodes[0].0, "root");
}

#[tokio::test]
async fn test_fetch_storage_legacy_is_aggregate() {
    let (room, _) = room_with_600_nodes().await;
    let (key, t) = join(&room, 7).await;
    t.drain();

    room.process_client_msgs(&key, vec![ClientMsg::FetchStorage]).await.unwrap();
    let msgs = t.drain();
    assert_eq!(msgs.len(), 1);
    assert!(matches!(&msgs[0], ServerMsg::InitialStorageState { items } if items.len() == 600));
}

#[tokio::test]
async fn test_low_memory_snapshot_matches() {
    let room = Room::new(
        "lm",
        Arc::new(MemoryDriver::new()),
        RoomConfig {
            low_memory_snapshots: true,
            storage_chunk_size: 2,
            ..RoomConfig::for_testing()
        },
    );
    room.load().await.unwrap();
    let (key, t) = join(&room, 8).await;
    room.process_client_msgs(
        &key,
        storage(vec![
            create("1:0", "a", CrdtType::Map, "root", "a"),
            create("1:1", "b", CrdtType::Map, "a", "b"),
        ]),
    )
    .await
    .unwrap();
    t.drain();

    room.process_client_msgs(&key, vec![ClientMsg::FetchStorage]).await.unwrap();
    let streamed: Vec<String> = t
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            ServerMsg::StorageChunk { nodes } => Some(nodes),
            _ => None,
        })
        .flatten()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(streamed, vec!["root", "a", "b"]);
}

// ─── Sessions ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_evicts_stale_session_before_room_state() {
    let room = memory_room();
    room.load().await.unwrap();
    let (_, old) = join(&room, 8).await;
    let (_, watcher) = join(&room, 8).await;
    let actor = actor_of(&old);
    watcher.drain();

    let (_, new) = join_as(&room, Some(actor), 8).await;

    let (close_seq, code, reason) = old.close_event().expect("old session closed");
    assert_eq!(code, 4011);
    assert_eq!(reason, "Closed stale connection");
    let (room_state_seq, first) = new.events()[0].clone();
    assert!(matches!(first, liveroom::session::TransportEvent::Message(ServerMsg::RoomState { .. })));
    assert!(close_seq < room_state_seq);

    assert_eq!(
        watcher.drain(),
        vec![
            ServerMsg::UserLeft { actor },
            ServerMsg::UserJoined {
                actor,
                id: None,
                info: Value::Null,
                scopes: vec!["room:write".into()]
            }
        ]
    );
    assert_eq!(room.session_count().await, 2);
}

#[tokio::test]
async fn test_invalid_frame_closes_session() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key, t) = join(&room, 8).await;
    let (_, other) = join(&room, 8).await;
    other.drain();

    // One bad message spoils the whole frame
    room.handle_data(&key, r#"[{"type":103,"event":1},{"type":999}]"#)
        .await
        .unwrap();
    assert_eq!(t.close_event().map(|(_, code, _)| code), Some(4000));
    assert_eq!(other.drain(), vec![ServerMsg::UserLeft { actor: actor_of(&t) }]);
    assert!(matches!(
        room.handle_data(&key, "ping").await,
        Err(RoomError::UnknownSession)
    ));
}

#[tokio::test]
async fn test_frame_batch_is_processed_in_order() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key, _) = join(&room, 8).await;
    let (_, other) = join(&room, 8).await;
    other.drain();

    room.handle_data(
        &key,
        r#"[{"type":103,"event":"first"},{"type":100,"data":{"x":1}},{"type":103,"event":"second"}]"#,
    )
    .await
    .unwrap();
    let codes: Vec<u64> = other.drain().iter().map(ServerMsg::code).collect();
    assert_eq!(codes, vec![103, 100, 103]);
}

#[tokio::test]
async fn test_targeted_presence_reaches_only_target() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key_a, _a) = join(&room, 8).await;
    let (_, b) = join(&room, 8).await;
    let (_, c) = join(&room, 8).await;
    let target = actor_of(&b);
    b.drain();
    c.drain();

    room.process_client_msgs(
        &key_a,
        vec![ClientMsg::UpdatePresence {
            data: object(json!({"cursor": [1, 2]})),
            target_actor: Some(target),
        }],
    )
    .await
    .unwrap();
    assert!(matches!(
        b.drain().as_slice(),
        [ServerMsg::UpdatePresence { target_actor: Some(t), .. }] if *t == target
    ));
    assert!(c.drain().is_empty());

    room.process_client_msgs(
        &key_a,
        vec![ClientMsg::UpdatePresence {
            data: object(json!({"cursor": null})),
            target_actor: Some(TARGET_EVERYONE),
        }],
    )
    .await
    .unwrap();
    assert_eq!(b.drain().len(), 1);
    assert_eq!(c.drain().len(), 1);
}

#[tokio::test]
async fn test_backend_session_buffers_replies() {
    let room = memory_room();
    room.load().await.unwrap();
    let (_, browser) = join(&room, 8).await;
    browser.drain();

    let ticket = room.create_ticket(TicketOptions { version: 8, ..TicketOptions::default() }).unwrap();
    let key = room.start_backend_session(ticket).await.unwrap();
    room.process_client_msgs(&key, vec![ClientMsg::FetchStorage]).await.unwrap();

    let replies = room.take_backend_replies(&key).await.unwrap();
    assert!(matches!(replies[0], ServerMsg::RoomState { .. }));
    assert_eq!(replies.last(), Some(&ServerMsg::StorageStreamEnd));
    assert!(room.take_backend_replies(&key).await.unwrap().is_empty());
    assert!(matches!(browser.drain()[0], ServerMsg::UserJoined { .. }));
}

#[tokio::test]
async fn test_end_session_by_predicate() {
    let room = memory_room();
    room.load().await.unwrap();
    join(&room, 7).await;
    join(&room, 7).await;
    let (_, keep) = join(&room, 8).await;

    let closed = room
        .end_session_by(
            |s| s.version < 8,
            CloseReason::Custom {
                code: 4001,
                reason: "Upgrade required".into(),
            },
        )
        .await;
    assert_eq!(closed, 2);
    assert_eq!(room.session_count().await, 1);
    assert!(!keep.is_closed());
}

#[tokio::test]
async fn test_failed_sends_are_reaped_transitively() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key_a, a) = join(&room, 8).await;
    let (_, b) = join(&room, 8).await;
    let (_, c) = join(&room, 8).await;
    a.drain();
    b.set_failing(true);
    c.set_failing(true);

    room.process_client_msgs(&key_a, vec![ClientMsg::BroadcastEvent { event: json!(1) }])
        .await
        .unwrap();
    assert_eq!(b.close_event().map(|(_, code, _)| code), Some(1011));
    assert_eq!(c.close_event().map(|(_, code, _)| code), Some(1011));
    let left = a
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ServerMsg::UserLeft { .. }))
        .count();
    assert_eq!(left, 2);
    assert_eq!(room.session_count().await, 1);
}

// ─── Leased sessions ──────────────────────────────────────────────────

#[tokio::test]
async fn test_leased_session_expires_with_one_user_left() {
    let clock = Arc::new(ManualClock::new(0));
    let room = Room::with_parts(
        "leased",
        Arc::new(MemoryDriver::new()),
        RoomConfig::for_testing(),
        Arc::new(liveroom::DefaultHooks),
        clock.clone(),
    );
    room.load().await.unwrap();
    let (_, watcher) = join(&room, 8).await;

    let leased = room
        .upsert_leased_session("agent", object(json!({"status": "typing"})), 1000, json!({"name": "agent"}))
        .await
        .unwrap();
    watcher.drain();

    clock.set(1000);
    assert_eq!(room.list_leased_sessions().await.unwrap().len(), 1);

    clock.set(1001);
    assert!(room.list_leased_sessions().await.unwrap().is_empty());
    assert!(room.list_leased_sessions().await.unwrap().is_empty());
    assert_eq!(watcher.drain(), vec![ServerMsg::UserLeft { actor: leased.actor }]);
}

#[tokio::test]
async fn test_room_state_includes_leased_sessions() {
    let room = memory_room();
    room.load().await.unwrap();
    let leased = room
        .upsert_leased_session("agent", object(json!({"x": 1})), 60_000, json!({"name": "agent"}))
        .await
        .unwrap();

    let (_, t) = join(&room, 8).await;
    let me = actor_of(&t);
    let msgs = t.messages();
    let ServerMsg::RoomState { users, .. } = &msgs[0] else { unreachable!() };
    let entry = &users[&leased.actor];
    assert_eq!(entry.id.as_deref(), Some("agent"));
    assert_eq!(entry.scopes, vec![LEASED_SESSION_SCOPE.to_string()]);
    assert_eq!(
        msgs[1],
        ServerMsg::UpdatePresence {
            actor: leased.actor,
            data: object(json!({"x": 1})),
            target_actor: Some(me),
        }
    );
}

// ─── Hooks ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    ended: AtomicUsize,
    updated: Arc<AtomicUsize>,
}

impl RoomHooks for Recorder {
    fn before_unload(&self, _room_id: &str) -> Result<(), HookError> {
        Err(HookError::Vetoed("still in use".into()))
    }

    fn on_session_started(&self, _room_id: &str, _session: &SessionSummary) -> Option<HookFuture> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Some(Box::pin(async { Err::<(), _>(HookError::Failed("webhook down".into())) }))
    }

    fn on_session_ended(&self, _room_id: &str, _session: &SessionSummary) -> Option<HookFuture> {
        self.ended.fetch_add(1, Ordering::SeqCst);
        None
    }

    fn on_storage_updated(&self, _room_id: &str) -> Option<HookFuture> {
        let updated = self.updated.clone();
        Some(Box::pin(async move {
            updated.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HookError>(())
        }))
    }
}

#[tokio::test]
async fn test_hooks_run_and_failures_are_isolated() {
    let hooks = Arc::new(Recorder::default());
    let room = Room::with_parts(
        "hooks",
        Arc::new(MemoryDriver::new()),
        RoomConfig::for_testing(),
        hooks.clone(),
        Arc::new(SystemClock),
    );
    room.load().await.unwrap();
    let (key, _) = join(&room, 8).await;

    room.process_client_msgs(&key, storage(vec![create("1:0", "m", CrdtType::Map, "root", "m")]))
        .await
        .unwrap();
    // An ignored op does not count as an update
    room.process_client_msgs(&key, storage(vec![create("1:0", "m", CrdtType::Map, "root", "m")]))
        .await
        .unwrap();
    assert!(room.end_browser_session(&key, CloseReason::Normal).await);

    assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.updated.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);

    assert!(matches!(room.unload().await, Err(RoomError::UnloadVetoed(_))));
    assert!(room.is_loaded());
}

// ─── Binary document ──────────────────────────────────────────────────

#[tokio::test]
async fn test_ydoc_update_broadcast_and_sync() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

    let room = memory_room();
    room.load().await.unwrap();
    let (key_a, a) = join(&room, 8).await;
    let (key_b, b) = join(&room, 8).await;
    a.drain();
    b.drain();

    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, "hello");
    }
    let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
    let encoded = STANDARD.encode(&update);

    room.process_client_msgs(&key_a, vec![ClientMsg::UpdateYdoc { update: encoded.clone() }])
        .await
        .unwrap();
    assert!(a.drain().is_empty());
    assert_eq!(
        b.drain(),
        vec![ServerMsg::UpdateYdoc {
            update: encoded,
            is_sync: false,
            state_vector: None
        }]
    );

    room.process_client_msgs(&key_b, vec![ClientMsg::FetchYdoc { vector: String::new() }])
        .await
        .unwrap();
    let reply = b.drain();
    let [ServerMsg::UpdateYdoc { update, is_sync: true, state_vector: Some(_) }] = reply.as_slice() else {
        panic!("expected a sync reply, got {reply:?}");
    };
    let fresh = Doc::new();
    {
        let bytes = STANDARD.decode(update).unwrap();
        let mut txn = fresh.transact_mut();
        txn.apply_update(Update::decode_v1(&bytes).unwrap()).unwrap();
    }
    let txn = fresh.transact();
    let content = txn.get_text("content").map(|t| t.get_string(&txn)).unwrap_or_default();
    assert_eq!(content, "hello");
}

#[tokio::test]
async fn test_bad_ydoc_update_is_dropped() {
    let room = memory_room();
    room.load().await.unwrap();
    let (key_a, _) = join(&room, 8).await;
    let (_, b) = join(&room, 8).await;
    b.drain();

    room.process_client_msgs(&key_a, vec![ClientMsg::UpdateYdoc { update: "!!not base64".into() }])
        .await
        .unwrap();
    assert!(b.drain().is_empty());
    assert_eq!(room.session_count().await, 2);
}
