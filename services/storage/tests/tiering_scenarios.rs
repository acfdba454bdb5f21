use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage_tiering::catalog::{Catalog, MemoryCatalog, NewRecording, Recording};
use storage_tiering::events::{BroadcastPublisher, TierEvent};
use storage_tiering::file_ops::FileOutcome;
use storage_tiering::handler::TierHandler;
use storage_tiering::health::HealthRegistry;
use storage_tiering::service::{TieringService, TieringSettings};
use storage_tiering::sweeper::{SweepMode, SweepTrigger, TierSweeper};
use storage_tiering::tier::{Tier, TierChain, TierLimits};
use tempfile::TempDir;
use tokio::fs;
use tokio_util::sync::CancellationToken;

fn tier(index: i32, root: &Path, limits: TierLimits) -> Tier {
    Tier {
        index,
        path: root.to_path_buf(),
        limits,
        move_on_shutdown: false,
        poll_interval: Duration::from_secs(3600),
    }
}

async fn write_segment(
    catalog: &MemoryCatalog,
    root: &Path,
    name: &str,
    size: usize,
    age: ChronoDuration,
) -> Recording {
    let path = root.join("cam1").join(name);
    fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    fs::write(&path, vec![7u8; size]).await.unwrap();

    catalog
        .insert(NewRecording {
            camera_id: "cam1".to_string(),
            category: "recorder".to_string(),
            path: path.to_string_lossy().into_owned(),
            size_bytes: size as i64,
            created_at: Utc::now() - age,
            ended_at: None,
        })
        .await
        .unwrap()
}

fn handler(catalog: &MemoryCatalog) -> (TierHandler, Arc<BroadcastPublisher>) {
    let publisher = Arc::new(BroadcastPublisher::new(64));
    (
        TierHandler::new(Arc::new(catalog.clone()), publisher.clone()),
        publisher,
    )
}

#[tokio::test]
async fn oversized_tier_moves_oldest_file_down() {
    let t1 = TempDir::new().unwrap();
    let t2 = TempDir::new().unwrap();
    let catalog = MemoryCatalog::new();
    let (handler, publisher) = handler(&catalog);
    let mut events = publisher.subscribe();

    let first = tier(
        0,
        t1.path(),
        TierLimits {
            max_size: Some(100),
            ..Default::default()
        },
    );
    let second = tier(1, t2.path(), TierLimits::default());
    let row = write_segment(&catalog, t1.path(), "seg1.mp4", 150, ChronoDuration::minutes(5)).await;

    let sweeper = TierSweeper::new(
        "cam1",
        "recorder",
        first,
        Some(second),
        handler,
        HealthRegistry::new(3),
        SweepTrigger::new(),
        None,
    );
    let report = sweeper
        .sweep_pass(SweepMode::Normal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.moved, 1);

    let moved = catalog.get(row.id).await.unwrap().unwrap();
    let expected = t2.path().join("cam1").join("seg1.mp4");
    assert_eq!(moved.tier, 1);
    assert_eq!(moved.path, expected.to_string_lossy());
    assert_eq!(moved.created_at, row.created_at);
    assert_eq!(moved.size_bytes, 150);
    assert!(!Path::new(&row.path).exists());
    assert_eq!(fs::read(&expected).await.unwrap().len(), 150);

    match events.try_recv().unwrap() {
        TierEvent::Moved { from_tier, to_tier, .. } => {
            assert_eq!((from_tier, to_tier), (0, 1));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn expired_file_is_deleted_from_last_tier() {
    let t1 = TempDir::new().unwrap();
    let catalog = MemoryCatalog::new();
    let (handler, _publisher) = handler(&catalog);

    let last = tier(
        0,
        t1.path(),
        TierLimits {
            max_age: Some(ChronoDuration::hours(1)),
            ..Default::default()
        },
    );
    let old = write_segment(&catalog, t1.path(), "old.mp4", 10, ChronoDuration::hours(2)).await;
    let fresh = write_segment(&catalog, t1.path(), "fresh.mp4", 10, ChronoDuration::minutes(1)).await;

    let sweeper = TierSweeper::new(
        "cam1",
        "recorder",
        last,
        None,
        handler,
        HealthRegistry::new(3),
        SweepTrigger::new(),
        None,
    );
    let cancel = CancellationToken::new();

    let report = tokio_test::assert_ok!(sweeper.sweep_pass(SweepMode::Normal, &cancel).await);
    assert_eq!(report.deleted, 1);
    assert!(!Path::new(&old.path).exists());
    assert!(catalog.get(old.id).await.unwrap().is_none());
    assert!(Path::new(&fresh.path).exists());

    let again = tokio_test::assert_ok!(sweeper.sweep_pass(SweepMode::Normal, &cancel).await);
    assert_eq!(again.selected, 0);
    assert_eq!(again.evaluated, 1);
}

#[tokio::test]
async fn concurrent_handlers_act_on_a_file_once() {
    let t1 = TempDir::new().unwrap();
    let t2 = TempDir::new().unwrap();
    let catalog = MemoryCatalog::new();
    let (handler, _publisher) = handler(&catalog);

    let first = tier(0, t1.path(), TierLimits::default());
    let second = tier(1, t2.path(), TierLimits::default());
    let row = write_segment(&catalog, t1.path(), "seg1.mp4", 10, ChronoDuration::minutes(5)).await;

    let (a, b) = tokio::join!(
        handler.handle_file(&row, &first, Some(&second)),
        handler.handle_file(&row, &first, Some(&second)),
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, FileOutcome::Conflict));

    assert!(matches!(outcomes[0], FileOutcome::Moved(_)));
    assert_eq!(outcomes[1], FileOutcome::Conflict);
    assert_eq!(catalog.len(), 1);
    assert!(t2.path().join("cam1").join("seg1.mp4").exists());

    // Two terminal handlers racing on the moved row
    let moved = catalog.get(row.id).await.unwrap().unwrap();
    let (a, b) = tokio::join!(
        handler.handle_file(&moved, &second, None),
        handler.handle_file(&moved, &second, None),
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, FileOutcome::Conflict));

    assert_eq!(outcomes, vec![FileOutcome::Deleted, FileOutcome::Conflict]);
    assert!(catalog.is_empty());
}

#[tokio::test]
async fn registered_recording_cascades_to_deletion() {
    let t1 = TempDir::new().unwrap();
    let t2 = TempDir::new().unwrap();
    let catalog = MemoryCatalog::new();
    let publisher = Arc::new(BroadcastPublisher::new(64));
    let mut events = publisher.subscribe();

    let expire_fast = TierLimits {
        max_age: Some(ChronoDuration::minutes(1)),
        ..Default::default()
    };
    let chain = TierChain::new(
        "recorder",
        vec![
            tier(0, t1.path(), expire_fast.clone()),
            tier(1, t2.path(), expire_fast),
        ],
    );
    let service = TieringService::new(
        vec![Arc::new(chain)],
        Arc::new(catalog.clone()),
        publisher.clone(),
        HealthRegistry::new(3),
        TieringSettings::default(),
    );

    let path = t1.path().join("cam1").join("seg1.mp4");
    fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    fs::write(&path, b"segment").await.unwrap();

    let row = service
        .register_recording(NewRecording {
            camera_id: "cam1".to_string(),
            category: "recorder".to_string(),
            path: path.to_string_lossy().into_owned(),
            size_bytes: 7,
            created_at: Utc::now() - ChronoDuration::minutes(10),
            ended_at: None,
        })
        .await
        .unwrap();

    assert!(service.start_camera("cam1"));

    let moved = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.recording_id(), row.id);
    assert_eq!(moved.to_tier(), Some(1));

    let deleted = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(deleted, TierEvent::Deleted { from_tier: 1, .. }));

    service.shutdown().await;

    assert!(catalog.is_empty());
    assert!(!path.exists());
    assert!(!t2.path().join("cam1").join("seg1.mp4").exists());
    assert!(service.health().is_healthy());
}

#[tokio::test]
async fn shutdown_drains_consecutive_transient_tiers() {
    let t1 = TempDir::new().unwrap();
    let t2 = TempDir::new().unwrap();
    let t3 = TempDir::new().unwrap();

    let transient = |index: i32, root: &Path| Tier {
        move_on_shutdown: true,
        ..tier(index, root, TierLimits::default())
    };
    let chain = TierChain::new(
        "recorder",
        vec![
            transient(0, t1.path()),
            transient(1, t2.path()),
            tier(2, t3.path(), TierLimits::default()),
        ],
    );

    for _ in 0..5 {
        let catalog = MemoryCatalog::new();
        for i in 0..20 {
            write_segment(
                &catalog,
                t1.path(),
                &format!("seg{i}.mp4"),
                10,
                ChronoDuration::minutes(5),
            )
            .await;
        }

        let service = TieringService::new(
            vec![Arc::new(chain.clone())],
            Arc::new(catalog.clone()),
            Arc::new(BroadcastPublisher::new(64)),
            HealthRegistry::new(3),
            TieringSettings::default(),
        );

        assert!(service.start_camera("cam1"));
        assert!(service.stop_camera("cam1").await);

        assert!(catalog.list_tier("recorder", None, 0).await.unwrap().is_empty());
        assert!(catalog.list_tier("recorder", None, 1).await.unwrap().is_empty());

        let settled = catalog.list_tier("recorder", None, 2).await.unwrap();
        assert_eq!(settled.len(), 20);
        for row in settled {
            assert!(Path::new(&row.path).starts_with(t3.path()));
            fs::remove_file(&row.path).await.unwrap();
        }
    }
}
