//! Unit tests for the allocation coordinator.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::*;
use crate::provider::InstanceState;
use crate::test_support::{FakeProvider, claim_of_exited_process, online_instance, recipe};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Harness {
    _temp: TempDir,
    provider: FakeProvider,
    registries: Registries,
    coordinator: AllocationCoordinator<FakeProvider>,
}

impl Harness {
    /// Seeds an instance that a previous allocation launched and released.
    async fn seed_released(&self, handle: InstanceHandle) {
        self.registries
            .global()
            .register_device(RegistryEntry::for_instance(&handle))
            .await
            .expect("seed global");
        self.provider.insert_instance(handle);
    }
}

#[fixture]
fn harness() -> Harness {
    let temp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
    let provider = FakeProvider::new();
    let registries = Registries::open(root);
    let coordinator =
        AllocationCoordinator::new(provider.clone(), registries.clone(), EventBus::default());
    Harness {
        _temp: temp,
        provider,
        registries,
        coordinator,
    }
}

#[rstest]
#[tokio::test]
async fn reuses_free_instance_before_creating(harness: Harness) {
    harness.seed_released(online_instance("idle", "r-1")).await;

    let handle = harness
        .coordinator
        .allocate_device(&recipe("r-1", "Pixel 6"))
        .await
        .expect("allocate");

    assert_eq!(handle.uuid, "idle");
    assert_eq!(harness.provider.create_calls(), 0);
    assert!(harness.registries.runtime().includes("idle").await.expect("runtime"));
}

#[rstest]
#[tokio::test]
async fn launches_and_connects_when_nothing_is_free(harness: Harness) {
    let handle = harness
        .coordinator
        .allocate_device(&recipe("r-1", "Pixel 6"))
        .await
        .expect("allocate");

    assert_eq!(handle.uuid, "fake-1");
    assert!(handle.is_adb_connected());
    assert_eq!(harness.provider.create_calls(), 1);
    assert_eq!(harness.provider.connect_calls(), 1);
    assert!(harness.registries.global().includes("fake-1").await.expect("global"));
}

#[rstest]
#[tokio::test]
async fn skips_instances_that_do_not_qualify(harness: Harness) {
    harness.seed_released(online_instance("other-recipe", "r-2")).await;
    let mut booting = online_instance("booting", "r-1");
    booting.state = InstanceState::Booting;
    harness.seed_released(booting).await;
    // Live but never launched by this installation.
    harness.provider.insert_instance(online_instance("foreign", "r-1"));

    let handle = harness
        .coordinator
        .allocate_device(&recipe("r-1", "Pixel 6"))
        .await
        .expect("allocate");

    assert_eq!(handle.uuid, "fake-1");
}

#[rstest]
#[tokio::test]
async fn released_device_is_handed_out_again(harness: Harness) {
    let pixel = recipe("r-1", "Pixel 6");
    let first = harness
        .coordinator
        .allocate_device(&pixel)
        .await
        .expect("first allocation");
    harness
        .coordinator
        .deallocate_device(&first.uuid)
        .await
        .expect("release");

    assert!(harness.registries.global().includes(&first.uuid).await.expect("global"));
    assert!(harness.provider.delete_calls().is_empty());

    let second = harness
        .coordinator
        .allocate_device(&pixel)
        .await
        .expect("second allocation");
    assert_eq!(second.uuid, first.uuid);
    assert_eq!(harness.provider.create_calls(), 1);
}

#[rstest]
#[tokio::test]
async fn claimed_device_is_never_handed_out_twice(harness: Harness) {
    let pixel = recipe("r-1", "Pixel 6");
    let first = harness
        .coordinator
        .allocate_device(&pixel)
        .await
        .expect("first allocation");
    let second = harness
        .coordinator
        .allocate_device(&pixel)
        .await
        .expect("second allocation");

    assert_ne!(first.uuid, second.uuid);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_get_distinct_devices(harness: Harness) {
    harness.seed_released(online_instance("idle-1", "r-1")).await;
    harness.seed_released(online_instance("idle-2", "r-1")).await;
    let coordinator = Arc::new(harness.coordinator);
    let pixel = recipe("r-1", "Pixel 6");

    let results = futures::future::join_all((0..5).map(|_| {
        let shared = Arc::clone(&coordinator);
        let wanted = pixel.clone();
        tokio::spawn(async move { shared.allocate_device(&wanted).await })
    }))
    .await;

    let uuids = results
        .into_iter()
        .map(|joined| joined.expect("join").expect("allocate").uuid)
        .collect::<BTreeSet<_>>();
    assert_eq!(uuids.len(), 5, "every allocation must own a distinct device");
    assert!(uuids.contains("idle-1") && uuids.contains("idle-2"));
    assert_eq!(harness.provider.create_calls(), 3);
}

#[rstest]
#[tokio::test]
async fn releasing_an_unclaimed_device_is_not_an_error(harness: Harness) {
    harness
        .coordinator
        .deallocate_device("never-claimed")
        .await
        .expect("release should be a no-op");
}

#[rstest]
#[tokio::test]
async fn provisioning_failure_reaches_the_caller(harness: Harness) {
    harness.provider.fail_create();

    let err = harness
        .coordinator
        .allocate_device(&recipe("r-1", "Pixel 6"))
        .await
        .expect_err("allocation should fail");

    assert!(matches!(err, AllocationError::Provisioning(_)));
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_does_not_serialise_allocations() {
    let temp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
    // Each list waits for the other, so a lock held across listing deadlocks.
    let provider = FakeProvider::new().with_list_barrier(2);
    let registries = Registries::open(root);
    let idle = online_instance("idle", "r-1");
    registries
        .global()
        .register_device(RegistryEntry::for_instance(&idle))
        .await
        .expect("seed global");
    provider.insert_instance(idle);
    let coordinator = Arc::new(AllocationCoordinator::new(
        provider.clone(),
        registries,
        EventBus::default(),
    ));
    let pixel = recipe("r-1", "Pixel 6");

    let allocations = futures::future::join_all((0..2).map(|_| {
        let shared = Arc::clone(&coordinator);
        let wanted = pixel.clone();
        tokio::spawn(async move { shared.allocate_device(&wanted).await })
    }));
    let results = tokio::time::timeout(std::time::Duration::from_secs(5), allocations)
        .await
        .expect("allocations listed concurrently");

    let uuids = results
        .into_iter()
        .map(|joined| joined.expect("join").expect("allocate").uuid)
        .collect::<BTreeSet<_>>();
    assert_eq!(uuids, BTreeSet::from([String::from("fake-1"), String::from("idle")]));
    assert_eq!(provider.list_calls(), 2);
}

#[rstest]
#[tokio::test]
async fn claims_left_by_an_exited_run_are_reclaimed(harness: Harness) {
    let idle = online_instance("idle", "r-1");
    harness
        .registries
        .register_launched(claim_of_exited_process(&idle))
        .await
        .expect("seed stale claim");
    harness.provider.insert_instance(idle);

    let reclaimed = harness
        .coordinator
        .reclaim_orphaned_claims()
        .await
        .expect("reclaim");
    let handle = harness
        .coordinator
        .allocate_device(&recipe("r-1", "Pixel 6"))
        .await
        .expect("allocate");

    assert_eq!(reclaimed, 1);
    assert_eq!(handle.uuid, "idle");
    assert_eq!(harness.provider.create_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn release_all_frees_every_claim_for_the_next_run(harness: Harness) {
    let pixel = recipe("r-1", "Pixel 6");
    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let coordinator =
        AllocationCoordinator::new(harness.provider.clone(), harness.registries.clone(), events);
    let first = coordinator.allocate_device(&pixel).await.expect("first");
    let second = coordinator.allocate_device(&pixel).await.expect("second");

    let released = coordinator.release_all().await.expect("release all");

    assert_eq!(released, 2);
    assert!(
        harness
            .registries
            .runtime()
            .read_registered_devices()
            .await
            .expect("runtime")
            .is_empty()
    );
    let mut seen = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let DeviceEvent::Released { uuid } = event {
            seen.push(uuid);
        }
    }
    seen.sort();
    assert_eq!(seen, vec![first.uuid.clone(), second.uuid.clone()]);

    let next_run = harness
        .coordinator
        .allocate_device(&pixel)
        .await
        .expect("next run");
    assert!(next_run.uuid == first.uuid || next_run.uuid == second.uuid);
    assert_eq!(harness.provider.create_calls(), 2);
}
