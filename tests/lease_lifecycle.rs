//! End-to-end lease lifecycle across independent registry handles.
//!
//! Each coordinator opens its own [`Registries`] on a shared directory, the
//! way separate worker processes of one test run do.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use emulease::teardown::DEFAULT_CONSOLE_URL;
use emulease::test_support::{FakeProvider, online_instance, recipe};
use emulease::{
    AllocationCoordinator, DeviceEvent, EventBus, Registries, RegistryEntry, Remediation,
    Teardown,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct SharedRun {
    _temp: TempDir,
    root: Utf8PathBuf,
    provider: FakeProvider,
}

impl SharedRun {
    fn worker(&self) -> AllocationCoordinator<FakeProvider> {
        AllocationCoordinator::new(
            self.provider.clone(),
            Registries::open(self.root.clone()),
            EventBus::default(),
        )
    }

    async fn seed_idle(&self, uuid: &str) {
        let handle = online_instance(uuid, "r-1");
        Registries::open(self.root.clone())
            .global()
            .register_device(RegistryEntry::for_instance(&handle))
            .await
            .unwrap_or_else(|err| panic!("seed: {err}"));
        self.provider.insert_instance(handle);
    }

    fn teardown(&self) -> Teardown<FakeProvider> {
        Teardown::new(
            self.provider.clone(),
            Registries::open(self.root.clone()),
            Remediation::new("gmsaas", DEFAULT_CONSOLE_URL),
        )
    }
}

#[fixture]
fn run() -> SharedRun {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
    SharedRun {
        _temp: temp,
        root,
        provider: FakeProvider::new(),
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_with_separate_registry_handles_never_share_a_device(run: SharedRun) {
    run.seed_idle("idle-1").await;
    run.seed_idle("idle-2").await;
    let pixel = recipe("r-1", "Pixel 6");
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let worker = run.worker();
        let wanted = pixel.clone();
        tasks.push(tokio::spawn(async move {
            worker.allocate_device(&wanted).await
        }));
    }

    let mut uuids = BTreeSet::new();
    for task in tasks {
        let handle = task
            .await
            .unwrap_or_else(|err| panic!("join: {err}"))
            .unwrap_or_else(|err| panic!("allocate: {err}"));
        assert!(uuids.insert(handle.uuid), "device handed out twice");
    }
    assert_eq!(uuids.len(), 4);
    assert!(uuids.contains("idle-1") && uuids.contains("idle-2"));
    assert_eq!(run.provider.create_calls(), 2);
}

#[rstest]
#[tokio::test]
async fn released_devices_are_reused_by_another_worker_then_swept(run: SharedRun) {
    let pixel = recipe("r-1", "Pixel 6");
    let first_worker = run.worker();
    let second_worker = run.worker();

    let leased = first_worker
        .allocate_device(&pixel)
        .await
        .unwrap_or_else(|err| panic!("allocate: {err}"));
    first_worker
        .deallocate_device(&leased.uuid)
        .await
        .unwrap_or_else(|err| panic!("release: {err}"));
    let reused = second_worker
        .allocate_device(&pixel)
        .await
        .unwrap_or_else(|err| panic!("reuse: {err}"));

    assert_eq!(reused.uuid, leased.uuid);
    assert_eq!(run.provider.create_calls(), 1);

    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let report = run
        .teardown()
        .with_events(events)
        .global_cleanup()
        .await
        .unwrap_or_else(|err| panic!("cleanup: {err}"));

    assert!(report.is_clean(), "{}", report.summary());
    assert!(run.provider.instances().is_empty());
    let event = receiver
        .recv()
        .await
        .unwrap_or_else(|err| panic!("event: {err}"));
    assert_eq!(
        event,
        DeviceEvent::Deleted {
            uuid: leased.uuid.clone()
        }
    );
}

#[rstest]
#[tokio::test]
async fn stuck_devices_survive_the_sweep_for_a_retry(run: SharedRun) {
    let worker = run.worker();
    let leased = worker
        .allocate_device(&recipe("r-1", "Pixel 6"))
        .await
        .unwrap_or_else(|err| panic!("allocate: {err}"));
    run.provider.fail_delete_for(&leased.uuid);

    let first = run
        .teardown()
        .global_cleanup()
        .await
        .unwrap_or_else(|err| panic!("cleanup: {err}"));

    assert_eq!(first.leaks.len(), 1);
    assert!(
        first
            .summary()
            .contains(&format!("gmsaas instances stop {}", leased.uuid))
    );

    let retry = run
        .teardown()
        .global_cleanup()
        .await
        .unwrap_or_else(|err| panic!("retry: {err}"));
    assert_eq!(retry.attempted(), 1);
}
