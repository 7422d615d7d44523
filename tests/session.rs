//! Voting session tests against in-memory stripes

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use wolfvote::peer::PeerClient;
use wolfvote::testing::{FakePeer, FakeStripe};
use wolfvote::voting::{SessionConfig, VotingSession};
use wolfvote::Error;

fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::new("voter-1");
    config.timing.heartbeat_interval_ms = 20;
    config.timing.registration_retry_ms = 20;
    config.timing.registration_round_ms = 300;
    config.timing.topology_fetch_interval_ms = 50;
    config.timing.shutdown_grace_ms = 1_000;
    config
}

fn session(stripe: &FakeStripe, seeds: &[&str]) -> VotingSession {
    VotingSession::new(
        "stripe-1",
        seeds.iter().map(|s| s.to_string()).collect(),
        fast_config(),
        stripe.factory(),
    )
}

fn addresses(list: &[&str]) -> HashSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_bootstrap_registers_with_the_only_active_seed() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::passive("a:1"));
    let b = stripe.insert(FakePeer::active("b:1"));
    let c = stripe.insert(FakePeer::passive("c:1"));
    for peer in [&a, &b, &c] {
        peer.set_topology(&["a:1", "b:1", "c:1"]);
    }

    let s = session(&stripe, &["a:1", "b:1", "c:1"]);
    let status = s.start();
    status
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(s.owner_address().await.as_deref(), Some("b:1"));
    assert_eq!(s.connected_servers().await, addresses(&["a:1", "b:1", "c:1"]));
    assert!(status.is_active().await);

    // Passive seeds are tracked but never voted for
    assert!(a.votes().is_empty());
    assert!(c.votes().is_empty());

    let snapshot = status.snapshot().await;
    assert_eq!(snapshot.owner.as_deref(), Some("b:1"));
    assert_eq!(snapshot.servers.len(), 3);
    assert!(snapshot.bootstrapped_at.is_some());

    s.stop().await;
}

#[tokio::test]
async fn test_topology_addition_adds_monitor() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    stripe.insert(FakePeer::passive("b:1"));
    a.set_topology(&["a:1", "b:1"]);

    let s = session(&stripe, &["a:1", "b:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    s.force_topology_update().await.unwrap();
    assert_eq!(s.count_connected_servers().await, 2);

    a.set_topology(&["a:1", "b:1", "c:1"]);
    s.force_topology_update().await.unwrap();

    assert_eq!(s.connected_servers().await, addresses(&["a:1", "b:1", "c:1"]));
    assert_eq!(s.existing_topology().await, addresses(&["a:1", "b:1", "c:1"]));
    let c = stripe.peer("c:1");
    wait_until("c to be registered", || c.registration_count() > 0).await;

    s.stop().await;
}

#[tokio::test]
async fn test_topology_removal_closes_monitor() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    let b = stripe.insert(FakePeer::passive("b:1"));
    a.set_topology(&["a:1", "b:1"]);

    let s = session(&stripe, &["a:1", "b:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    a.set_topology(&["a:1"]);
    s.force_topology_update().await.unwrap();

    assert_eq!(s.connected_servers().await, addresses(&["a:1"]));
    assert_eq!(s.existing_topology().await, addresses(&["a:1"]));
    assert!(!b.is_connected());

    s.stop().await;
}

#[tokio::test]
async fn test_passive_owner_view_does_not_change_membership() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    stripe.insert(FakePeer::passive("b:1"));
    a.set_topology(&["a:1", "b:1"]);

    let s = session(&stripe, &["a:1", "b:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    a.set_state("PASSIVE-STANDBY");
    a.set_topology(&["a:1"]);
    s.force_topology_update().await.unwrap();

    assert_eq!(s.connected_servers().await, addresses(&["a:1", "b:1"]));
    assert_eq!(s.existing_topology().await, addresses(&["a:1"]));

    s.stop().await;
}

#[tokio::test]
async fn test_owner_is_voted_for_every_election_event() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    a.set_topology(&["a:1"]);

    let s = session(&stripe, &["a:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    a.set_heartbeat(3);
    wait_until("repeated votes", || a.votes().len() >= 3).await;
    assert!(a.votes().iter().all(|term| *term == 3));
    assert_eq!(a.last_voted_generation(), 3);
    assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));

    s.stop().await;
}

#[tokio::test]
async fn test_vote_is_stolen_by_newer_term() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    let b = stripe.insert(FakePeer::passive("b:1"));
    a.set_topology(&["a:1", "b:1"]);
    b.set_topology(&["a:1", "b:1"]);

    let s = session(&stripe, &["a:1", "b:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    // The owner was last certified for term 5 and then vanishes
    a.set_last_voted(5);
    a.disconnect();
    let session = &s;
    eventually("a to be evicted", move || async move {
        session.connected_servers().await == addresses(&["b:1"])
    })
    .await;
    assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));

    b.set_heartbeat(6);
    eventually("b to own the vote", move || async move {
        session.owner_address().await.as_deref() == Some("b:1")
    })
    .await;

    assert_eq!(b.votes().first(), Some(&6));
    assert!(a.zombie_count() >= 1);
    assert!(a.votes().is_empty());

    s.stop().await;
}

#[tokio::test]
async fn test_equal_term_is_zombied_while_owner_votes() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    let b = stripe.insert(FakePeer::passive("b:1"));
    a.set_topology(&["a:1", "b:1"]);

    let s = session(&stripe, &["a:1", "b:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    a.set_heartbeat(5);
    wait_until("a to vote", || !a.votes().is_empty()).await;

    b.set_heartbeat(5);
    wait_until("b to be zombied", || b.zombie_count() >= 1).await;

    // Zombied for term 5, so the same term no longer raises events
    let zombies = b.zombie_count();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(b.zombie_count(), zombies);
    assert!(!b.is_voting());
    assert!(b.votes().is_empty());
    assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));

    s.stop().await;
}

#[tokio::test]
async fn test_losing_every_server_restarts_bootstrap() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    a.set_topology(&["a:1"]);

    let s = session(&stripe, &["a:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    let registrations = a.registration_count();

    a.fail_heartbeats();
    wait_until("a fresh registration", || a.registration_count() > registrations).await;

    a.restore_heartbeats();
    let session = &s;
    eventually("the stripe to recover", move || async move {
        session.owner_address().await.as_deref() == Some("a:1")
            && session.count_connected_servers().await == 1
    })
    .await;

    s.stop().await;
}

#[tokio::test]
async fn test_failed_round_refreshes_seeds_from_topology() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::passive("a:1"));
    let c = stripe.insert(FakePeer::active("c:1"));
    a.set_topology(&["a:1", "c:1"]);
    c.set_topology(&["a:1", "c:1"]);

    // Only the passive server is known up front
    let s = session(&stripe, &["a:1"]);
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(s.owner_address().await.as_deref(), Some("c:1"));
    assert_eq!(s.existing_topology().await, addresses(&["a:1", "c:1"]));

    s.stop().await;
}

#[tokio::test]
async fn test_reachable_seed_is_kept_across_rounds() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::passive("a:1"));
    a.set_topology(&["a:1"]);

    let s = session(&stripe, &["a:1"]);
    let status = s.start();

    // Several rounds pass with the seed reachable but not yet active
    sleep(Duration::from_millis(1_000)).await;
    assert!(!status.is_active().await);
    assert_eq!(a.close_count(), 0);
    assert!(a.is_connected());

    a.set_state("ACTIVE-COORDINATOR");
    status
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));

    s.stop().await;
}

#[tokio::test]
async fn test_refused_registration_keeps_retrying() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    a.set_topology(&["a:1"]);
    a.set_accept_registration(false);
    a.set_voter_capacity(1, 1);

    let s = session(&stripe, &["a:1"]);
    let status = s.start();
    wait_until("several attempts", || a.registration_count() >= 3).await;
    assert!(!status.is_active().await);

    a.set_accept_registration(true);
    status
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(s.owner_address().await.as_deref(), Some("a:1"));

    s.stop().await;
}

#[tokio::test]
async fn test_unreachable_stripe_times_out() {
    let stripe = FakeStripe::new();
    stripe.peer("a:1").set_reachable(false);

    let s = session(&stripe, &["a:1"]);
    let status = s.start();
    let result = status
        .await_registration_with_all_timeout(Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(Error::RegistrationTimeout)));
    assert!(!status.is_active().await);

    s.stop().await;
}

#[tokio::test]
async fn test_stop_deregisters_and_closes() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    let b = stripe.insert(FakePeer::passive("b:1"));
    a.set_topology(&["a:1", "b:1"]);

    let s = session(&stripe, &["a:1", "b:1"]);
    let status = s.start();
    status
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    s.stop().await;

    assert_eq!(a.deregistration_count(), 1);
    assert_eq!(b.deregistration_count(), 1);
    assert!(!a.is_connected());
    assert!(!b.is_connected());
    assert_eq!(s.count_connected_servers().await, 0);
    assert!(s.owner_address().await.is_none());
    assert!(matches!(
        status.await_registration_with_all().await,
        Err(Error::Cancelled)
    ));
}

#[tokio::test]
async fn test_election_events_are_observable() {
    let stripe = FakeStripe::new();
    let a = stripe.insert(FakePeer::active("a:1"));
    a.set_topology(&["a:1"]);

    let s = session(&stripe, &["a:1"]);
    let mut votes = s.subscribe_votes();
    s.start()
        .await_registration_with_all_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    a.push_heartbeat(2);
    let address = tokio::time::timeout(Duration::from_secs(5), votes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(address, "a:1");

    s.stop().await;
}
