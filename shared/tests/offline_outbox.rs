use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::offline_store::PendingMedia;
use shared::{
    MediaId, MediaPayload, MediaStoreConfig, MediaStoreError, MediaUploader, MemoryKvStore,
    NetworkStatusMonitor, OfflineMediaStore, OperationError, OperationQueue, QueueConfig,
    SyncConfig, SyncCoordinator, SyncEvent, SyncTrigger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Backend stand-in that is "offline" until told otherwise.
#[derive(Default)]
struct FakeBackend {
    reachable: Mutex<bool>,
    uploads: Mutex<Vec<(String, String, usize)>>,
}

#[async_trait]
impl MediaUploader for FakeBackend {
    async fn upload(
        &self,
        media: &PendingMedia,
        payload: MediaPayload,
        _cancel: CancellationToken,
    ) -> Result<(), OperationError> {
        if !*self.reachable.lock() {
            return Err(OperationError::transient("network unreachable"));
        }
        self.uploads.lock().push((
            media.checklist_item_id.clone(),
            media.inspection_id.clone(),
            payload.bytes.len(),
        ));
        Ok(())
    }
}

fn build(
    storage: Arc<MemoryKvStore>,
    backend: Arc<FakeBackend>,
) -> Arc<OfflineMediaStore> {
    let queue = Arc::new(OperationQueue::new(QueueConfig::default()).unwrap());
    Arc::new(
        OfflineMediaStore::open(storage, queue, backend, MediaStoreConfig::default()).unwrap(),
    )
}

async fn wait_for_pass(events: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    loop {
        let event = events.recv().await.unwrap();
        if matches!(event, SyncEvent::PassCompleted { .. }) {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn full_offline_to_online_flow() {
    let storage = Arc::new(MemoryKvStore::new());
    let backend = Arc::new(FakeBackend::default());
    let store = build(Arc::clone(&storage), Arc::clone(&backend));
    let network = NetworkStatusMonitor::new(false);
    let coordinator =
        SyncCoordinator::start(Arc::clone(&store), network.clone(), SyncConfig::default())
            .unwrap();
    let mut events = coordinator.subscribe();

    // 1. Offline capture: persisted, nothing uploaded
    let id = coordinator
        .capture(
            MediaPayload::new(vec![0xFF, 0xD8, 0xFF, 0xE0], "image/jpeg"),
            "item-1",
            "insp-1",
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!store.get(&id).unwrap().uploaded);
    assert_eq!(store.get_stats().pending_count, 1);
    assert!(backend.uploads.lock().is_empty());

    // 2. Connectivity returns; the pass runs after the stabilization delay
    *backend.reachable.lock() = true;
    network.set_online(true);

    let event = wait_for_pass(&mut events).await;
    assert_matches!(
        event,
        SyncEvent::PassCompleted { trigger: SyncTrigger::NetworkRestored, ref report } if report.uploaded == 1
    );

    // 3. Entry flipped to uploaded, stays until cleanup
    let entry = store.get(&id).unwrap();
    assert!(entry.uploaded);
    assert_eq!(
        backend.uploads.lock().as_slice(),
        &[("item-1".to_string(), "insp-1".to_string(), 4)]
    );
    assert_eq!(store.cleanup().unwrap(), 1);
    assert!(store.get(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn captured_media_survives_restart() {
    let storage = Arc::new(MemoryKvStore::new());
    let backend = Arc::new(FakeBackend::default());

    let id: MediaId = {
        let store = build(Arc::clone(&storage), Arc::clone(&backend));
        store
            .save(MediaPayload::new(vec![7u8; 64], "video/mp4"), "item-9", "insp-3")
            .unwrap()
    };

    // New process: metadata and payload both come back from storage
    *backend.reachable.lock() = true;
    let store = build(Arc::clone(&storage), Arc::clone(&backend));
    let entry = store.get(&id).unwrap();
    assert_eq!(entry.size_bytes, 64);
    assert_eq!(entry.content_type, "video/mp4");

    let network = NetworkStatusMonitor::new(true);
    let coordinator =
        SyncCoordinator::start(Arc::clone(&store), network, SyncConfig::default()).unwrap();
    let mut events = coordinator.subscribe();

    let event = wait_for_pass(&mut events).await;
    assert_matches!(event, SyncEvent::PassCompleted { trigger: SyncTrigger::Startup, .. });
    assert!(store.get(&id).unwrap().uploaded);
    assert_eq!(backend.uploads.lock()[0].2, 64);
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_is_retried_on_next_transition_only() {
    let backend = Arc::new(FakeBackend::default());
    let store = build(Arc::new(MemoryKvStore::new()), Arc::clone(&backend));
    let network = NetworkStatusMonitor::new(false);
    let coordinator =
        SyncCoordinator::start(Arc::clone(&store), network.clone(), SyncConfig::default())
            .unwrap();
    let mut events = coordinator.subscribe();

    let id = store
        .save(MediaPayload::new(vec![1u8; 8], "image/png"), "item-1", "insp-1")
        .unwrap();

    network.set_online(true);
    wait_for_pass(&mut events).await;
    assert_eq!(store.get(&id).unwrap().retry_count, 1);

    // Staying online does not spin
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(store.get(&id).unwrap().retry_count, 1);

    network.set_online(false);
    *backend.reachable.lock() = true;
    network.set_online(true);
    wait_for_pass(&mut events).await;
    assert!(store.get(&id).unwrap().uploaded);
}

#[tokio::test(start_paused = true)]
async fn transition_during_running_pass_is_ignored() {
    let backend = Arc::new(FakeBackend::default());
    *backend.reachable.lock() = true;
    let store = build(Arc::new(MemoryKvStore::new()), Arc::clone(&backend));
    store
        .save(MediaPayload::new(vec![1u8; 8], "image/png"), "item-1", "insp-1")
        .unwrap();

    let network = NetworkStatusMonitor::new(false);
    let coordinator = SyncCoordinator::start(
        Arc::clone(&store),
        network.clone(),
        SyncConfig {
            stabilization_delay_ms: 0,
        },
    )
    .unwrap();
    let mut events = coordinator.subscribe();

    // Manual pass and network pass race; only one may run at a time
    let (manual, _) = tokio::join!(coordinator.sync_now(), async {
        network.set_online(true);
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut running = 0i32;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::PassStarted { .. } => {
                running += 1;
                assert_eq!(running, 1, "two passes overlapped");
            }
            SyncEvent::PassCompleted { .. } => running -= 1,
            SyncEvent::PassSkipped { .. } => {}
        }
    }
    assert_eq!(manual.unwrap().uploaded, 1);
    assert_eq!(backend.uploads.lock().len(), 1);
}

#[tokio::test]
async fn save_rejects_oversized_payload() {
    let queue = Arc::new(OperationQueue::new(QueueConfig::default()).unwrap());
    let store = OfflineMediaStore::open(
        Arc::new(MemoryKvStore::new()),
        queue,
        Arc::new(FakeBackend::default()),
        MediaStoreConfig {
            max_payload_bytes: 4,
            ..MediaStoreConfig::default()
        },
    )
    .unwrap();

    let err = store
        .save(MediaPayload::new(vec![0u8; 5], "image/png"), "item-1", "insp-1")
        .unwrap_err();
    assert_matches!(err, MediaStoreError::PayloadTooLarge { size: 5, max: 4 });
}
