/// Multi-user scenarios: several engines sharing one store
use collaboration::*;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tokio_test::assert_ok;

struct Client {
    engine: CollabEngine,
    notes: tokio::sync::mpsc::UnboundedReceiver<Notification>,
}

fn client(name: &str, store: &InMemoryStore, clock: &Arc<ManualClock>, config: EngineConfig) -> Client {
    let (notifier, notes) = ChannelNotifier::new();
    let engine = CollabEngine::builder(Actor::new(ActorId::new(), name), Arc::new(store.clone()))
        .config(config)
        .clock(clock.clone())
        .notifier(Arc::new(notifier))
        .build()
        .unwrap();
    engine.start();
    Client { engine, notes }
}

fn square(x: f64) -> Shape {
    Shape::new(ShapeId::new(), Point::new(x, 0.0), Size::new(50.0, 50.0))
}

#[tokio::test(start_paused = true)]
async fn test_two_users_converge() {
    let store = InMemoryStore::new();
    let clock = Arc::new(ManualClock::new(1000));
    let xavier = client("Xavier", &store, &clock, EngineConfig::default());
    let yara = client("Yara", &store, &clock, EngineConfig::default());

    let shape = square(0.0);
    assert_ok!(xavier.engine.create_shape(shape.clone()));
    time::sleep(Duration::from_secs(1)).await;
    assert!(yara.engine.shape(shape.id).is_some());

    clock.advance(500);
    assert_ok!(yara.engine.move_shape(shape.id, Point::new(300.0, 120.0)));
    assert_ok!(yara.engine.update_shape(shape.id, ShapePatch::default().with_fill("#ff8800")));
    time::sleep(Duration::from_secs(1)).await;

    let seen = xavier.engine.shape(shape.id).unwrap();
    assert_eq!(seen.position, Point::new(300.0, 120.0));
    assert_eq!(seen.fill, "#ff8800");
    assert_eq!(seen.last_modified_by, Some(yara.engine.actor().id));

    assert!(xavier.engine.is_idle());
    assert!(yara.engine.is_idle());
    assert_eq!(xavier.engine.shapes(), store.snapshot());
    assert_eq!(yara.engine.shapes(), store.snapshot());
}

#[tokio::test(start_paused = true)]
async fn test_remote_delete_rolls_back_pending_edit() {
    let shape = square(0.0);
    let store = InMemoryStore::with_shapes(vec![shape.clone()]);
    let clock = Arc::new(ManualClock::new(1000));

    // Xavier's edits sit in a long batch window
    let mut slow = EngineConfig::default();
    slow.batch.batch_delay_ms = 1000;
    let mut xavier = client("Xavier", &store, &clock, slow);
    let yara = client("Yara", &store, &clock, EngineConfig::default());

    let rotate = assert_ok!(xavier.engine.rotate_shape(shape.id, 90.0));
    assert!(xavier.engine.is_pending(rotate));

    clock.set(1200);
    assert_ok!(yara.engine.delete_shape(shape.id));
    time::sleep(Duration::from_millis(500)).await;

    assert!(store.get(shape.id).is_none());
    assert!(xavier.engine.shape(shape.id).is_none());
    assert!(!xavier.engine.is_pending(rotate));

    let failed = xavier.engine.failed_ops();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].operation.id, rotate);
    assert!(matches!(failed[0].reason, FailureReason::RolledBack(_)));

    let note = xavier.notes.try_recv().unwrap();
    assert_eq!(note.conflict_kind, ConflictKind::DeleteWhileEditing);
    assert_eq!(note.severity, 5);
    assert_eq!(note.shape_ids, vec![shape.id]);

    // the rotation never reaches the store
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.write_count(), 1);
    assert!(xavier.engine.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_history_is_per_user() {
    let a = square(0.0);
    let b = square(100.0);
    let store = InMemoryStore::with_shapes(vec![a.clone(), b.clone()]);
    let clock = Arc::new(ManualClock::new(1000));
    let xavier = client("Xavier", &store, &clock, EngineConfig::default());
    let yara = client("Yara", &store, &clock, EngineConfig::default());
    let (x, y) = (xavier.engine.actor().id, yara.engine.actor().id);

    assert_ok!(xavier.engine.move_shape(a.id, Point::new(10.0, 10.0)));
    clock.advance(100);
    assert_ok!(yara.engine.resize_shape(b.id, Size::new(80.0, 80.0)));
    time::sleep(Duration::from_secs(1)).await;

    // nobody steps through someone else's history
    assert_eq!(
        assert_ok!(xavier.engine.undo(y)),
        HistoryStep::Refused(RefusalReason::NotOwner { requester: y })
    );

    clock.advance(100);
    assert!(matches!(assert_ok!(yara.engine.undo(y)), HistoryStep::Ready(_)));
    assert_eq!(assert_ok!(yara.engine.undo(y)), HistoryStep::Empty);
    time::sleep(Duration::from_secs(1)).await;

    assert_eq!(store.get(b.id).unwrap().size, Size::new(50.0, 50.0));
    assert_eq!(store.get(a.id).unwrap().position, Point::new(10.0, 10.0));
    assert_eq!(xavier.engine.shape(b.id).unwrap().size, Size::new(50.0, 50.0));

    assert!(matches!(assert_ok!(xavier.engine.undo(x)), HistoryStep::Ready(_)));
    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.get(a.id).unwrap().position, Point::new(0.0, 0.0));
    assert_eq!(yara.engine.shape(a.id).unwrap().position, Point::new(0.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn test_undo_refused_after_remote_edit() {
    let shape = square(0.0);
    let store = InMemoryStore::with_shapes(vec![shape.clone()]);
    let clock = Arc::new(ManualClock::new(1000));
    let xavier = client("Xavier", &store, &clock, EngineConfig::default());
    let yara = client("Yara", &store, &clock, EngineConfig::default());
    let (x, y) = (xavier.engine.actor().id, yara.engine.actor().id);

    assert_ok!(xavier.engine.move_shape(shape.id, Point::new(40.0, 40.0)));
    time::sleep(Duration::from_secs(1)).await;
    clock.advance(1000);
    assert_ok!(yara.engine.rotate_shape(shape.id, 15.0));
    time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        assert_ok!(xavier.engine.undo(x)),
        HistoryStep::Refused(RefusalReason::StaleOperation {
            shape: shape.id,
            modified_by: y
        })
    );
    assert_eq!(store.get(shape.id).unwrap().position, Point::new(40.0, 40.0));
}

#[tokio::test(start_paused = true)]
async fn test_engine_from_json_config() {
    let config = assert_ok!(EngineConfig::from_json_str(
        r#"{ "rate_limit": { "max_updates_per_second": 2, "debounce_ms": 0, "throttle_ms": 0, "batch": false } }"#,
    ));
    assert_eq!(config.history.max_depth, 100);
    assert!(EngineConfig::from_json_str(r#"{ "rate_limit": { "max_updates_per_second": 0 } }"#).is_err());

    let shape = square(0.0);
    let store = InMemoryStore::with_shapes(vec![shape.clone()]);
    let clock = Arc::new(ManualClock::new(1000));
    let xavier = client("Xavier", &store, &clock, config);

    for step in 1..=5 {
        clock.advance(10);
        assert_ok!(xavier.engine.move_shape(shape.id, Point::new(step as f64, 0.0)));
        time::sleep(Duration::from_millis(10)).await;
    }

    // two writes per rolling second, the rest waits in order
    time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.write_count(), 2);

    time::sleep(Duration::from_secs(3)).await;
    assert_eq!(store.write_count(), 5);
    assert_eq!(store.get(shape.id).unwrap().position, Point::new(5.0, 0.0));
    assert_eq!(xavier.engine.pending_count(), 0);
    assert!(xavier.engine.is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_writes() {
    let shape = square(0.0);
    let store = InMemoryStore::with_shapes(vec![shape.clone()]);
    let clock = Arc::new(ManualClock::new(1000));
    let xavier = client("Xavier", &store, &clock, EngineConfig::default());

    assert_ok!(xavier.engine.update_shape(shape.id, ShapePatch::default().with_opacity(0.25)));
    let report = xavier.engine.shutdown().await;

    assert_eq!(report.written, 1);
    assert_eq!(store.get(shape.id).unwrap().opacity, 0.25);
    assert_eq!(store.subscriber_count(), 0);
}
