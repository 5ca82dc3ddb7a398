mod common;

use common::*;
use std::sync::Arc;

use hc_case_scout::core::types::SearchQuery;
use hc_case_scout::features::sweep::SweepPlan;
use hc_case_scout::features::topology::Topology;

fn navigations(world: &SharedWorld) -> u32 {
    world.lock().unwrap().navigations
}

#[tokio::test]
async fn repeat_bench_lookup_is_served_from_cache() {
    init_tracing();
    let world = World::standard();
    let topology = Topology::new(test_config(5));
    let mut portal = FakePortal::new(world.clone());

    let first = topology.discover_benches(&mut portal, "C1").await.unwrap();
    let after_first = navigations(&world);
    assert_eq!(after_first, 1);

    let second = topology.discover_benches(&mut portal, "C1").await.unwrap();
    assert_eq!(navigations(&world), after_first);
    assert_eq!(first, second);
    assert!(topology.has_bench(&mut portal, "C1", "B2").await.unwrap());
    // Court list was not cached yet; benches still were.
    assert_eq!(navigations(&world), after_first + 1);
}

#[tokio::test]
async fn concurrent_refreshes_of_one_court_navigate_once() {
    init_tracing();
    let world = World::standard();
    let topology = Arc::new(Topology::new(test_config(5)));
    let mut warm = FakePortal::new(world.clone());
    topology.discover_benches(&mut warm, "C1").await.unwrap();

    let seen = topology.generation();
    let before = navigations(&world);
    let mut a = FakePortal::new(world.clone());
    let mut b = FakePortal::new(world.clone());
    let (ga, gb) = tokio::join!(
        topology.refresh(&mut a, "C1", seen),
        topology.refresh(&mut b, "C1", seen),
    );

    assert_eq!(ga.unwrap(), gb.unwrap());
    assert_eq!(topology.refresh_count(), 1);
    // One refresh: the court list and C1's benches, one page load each.
    assert_eq!(navigations(&world) - before, 2);
}

#[tokio::test]
async fn refresh_of_another_court_is_not_joined() {
    init_tracing();
    let world = World::standard();
    let topology = Topology::new(test_config(5));
    let mut portal = FakePortal::new(world.clone());
    topology.discover_benches(&mut portal, "C1").await.unwrap();
    topology.discover_benches(&mut portal, "C2").await.unwrap();

    world
        .lock()
        .unwrap()
        .benches
        .get_mut("C1")
        .unwrap()
        .push(("B3".into(), "New Bench".into()));

    let seen = topology.generation();
    topology.refresh(&mut portal, "C2", seen).await.unwrap();
    topology.refresh(&mut portal, "C1", seen).await.unwrap();

    assert_eq!(topology.refresh_count(), 2);
    let c1 = topology.cached_benches("C1").await.unwrap();
    assert!(c1.iter().any(|b| b.id == "B3"));
}

#[tokio::test]
async fn sweep_covers_every_bench_of_target_courts() {
    init_tracing();
    let world = World::standard();
    let topology = Topology::new(test_config(5));
    let mut portal = FakePortal::new(world.clone());

    let plan = SweepPlan {
        court_ids: vec!["C1".into(), "C9".into()],
        ..Default::default()
    };
    let listing = plan.listing(&topology, &mut portal).await.unwrap();
    assert_eq!(listing.len(), 1);

    let requests = plan.requests(&listing, 20);
    let benches: Vec<&str> = requests.iter().map(|r| r.bench_id.as_str()).collect();
    assert_eq!(benches, vec!["B1", "B2"]);
    assert!(requests.iter().all(|r| r.court_id == "C1"));
    assert!(matches!(&requests[0].query, SearchQuery::PartyName { name, .. } if name == "kumar"));
}

#[tokio::test]
async fn sweep_without_listed_courts_fails() {
    init_tracing();
    let world = World::standard();
    let topology = Topology::new(test_config(5));
    let mut portal = FakePortal::new(world.clone());

    let plan = SweepPlan {
        court_ids: vec!["C9".into()],
        ..Default::default()
    };
    assert!(plan.listing(&topology, &mut portal).await.is_err());
}
