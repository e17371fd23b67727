//! Leader election across several memberships sharing one backend
//!
//! These tests cover:
//! - Exactly one leader among N concurrently started members
//! - Handover when the leader leaves
//! - Recovery from two members both tagged leader

use parking_lot::Mutex;
use relay_server::cluster::{ClusterConfig, Coordinator, Membership, MemoryCoordinator, NodeIdentity};
use relay_server::LeadershipObserver;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Transitions(Mutex<Vec<bool>>);

impl LeadershipObserver for Transitions {
    fn on_leadership_change(&self, is_leader: bool) {
        self.0.lock().push(is_leader);
    }
}

fn fast_config() -> ClusterConfig {
    ClusterConfig {
        session_ttl_ms: 1000,
        check_ttl_ms: 1000,
        heartbeat_interval_ms: 100,
        keepalive_timeout_ms: 600,
        election_interval_ms: 100,
        check_interval_ms: 150,
        probe_timeout_ms: 100,
        ..ClusterConfig::default()
    }
}

fn identity(n: usize) -> NodeIdentity {
    NodeIdentity {
        node_id: format!("node-{}", n),
        hostname: format!("host-{}", n),
        service_ip: "127.0.0.1".to_string(),
        port: 0,
    }
}

struct Member {
    membership: Arc<Membership>,
    transitions: Arc<Transitions>,
    shutdown: CancellationToken,
}

async fn start_members(backend: &Arc<MemoryCoordinator>, count: usize) -> Vec<Member> {
    let mut members = Vec::with_capacity(count);
    for n in 0..count {
        let transitions = Arc::new(Transitions::default());
        let membership = Membership::new(
            fast_config(),
            identity(n),
            backend.clone() as Arc<dyn Coordinator>,
            vec![transitions.clone() as Arc<dyn LeadershipObserver>],
        );
        let shutdown = CancellationToken::new();
        membership.start(&shutdown).await.unwrap();
        members.push(Member {
            membership,
            transitions,
            shutdown,
        });
    }
    members
}

fn leaders(members: &[Member]) -> Vec<usize> {
    members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.membership.is_leader())
        .map(|(n, _)| n)
        .collect()
}

async fn wait_for_single_leader(members: &[Member]) -> usize {
    for _ in 0..50 {
        let current = leaders(members);
        if current.len() == 1 {
            return current[0];
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("no single leader emerged: {:?}", leaders(members));
}

#[tokio::test]
async fn test_exactly_one_leader() {
    let backend = Arc::new(MemoryCoordinator::with_min_session_ttl(Duration::from_millis(500)));
    let members = start_members(&backend, 4).await;

    let leader = wait_for_single_leader(&members).await;

    // Stays stable over several election rounds
    for _ in 0..5 {
        sleep(Duration::from_millis(100)).await;
        assert_eq!(leaders(&members), vec![leader]);
    }

    let published = members[0].membership.leader().await.unwrap();
    assert_eq!(published.session_id, format!("node-{}", leader));
    assert_eq!(members[0].membership.list_members().await.unwrap().len(), 4);

    for (n, member) in members.iter().enumerate() {
        let seen = member.transitions.0.lock().clone();
        if n == leader {
            assert_eq!(seen, vec![true]);
        } else {
            assert_eq!(seen, vec![false]);
        }
    }

    for member in &members {
        member.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_leader_leave_hands_over() {
    let backend = Arc::new(MemoryCoordinator::with_min_session_ttl(Duration::from_millis(500)));
    let members = start_members(&backend, 3).await;
    let first = wait_for_single_leader(&members).await;

    members[first].shutdown.cancel();
    members[first].membership.leave().await;

    let survivors: Vec<&Member> = members
        .iter()
        .enumerate()
        .filter(|(n, _)| *n != first)
        .map(|(_, m)| m)
        .collect();

    let mut next = None;
    for _ in 0..50 {
        let current: Vec<usize> = survivors
            .iter()
            .enumerate()
            .filter(|(_, m)| m.membership.is_leader())
            .map(|(n, _)| n)
            .collect();
        if current.len() == 1 {
            next = Some(current[0]);
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let next = next.expect("a survivor should take over");
    assert_eq!(survivors[next].transitions.0.lock().last(), Some(&true));
    assert_eq!(
        survivors[0].membership.list_members().await.unwrap().len(),
        2
    );

    for member in &survivors {
        member.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_double_leader_tag_recovers_to_one() {
    let backend = Arc::new(MemoryCoordinator::with_min_session_ttl(Duration::from_millis(500)));
    let members = start_members(&backend, 3).await;
    let leader = wait_for_single_leader(&members).await;
    let intruder = (leader + 1) % members.len();

    // The lock is deleted behind the leader's back and taken by another
    // member, so both publish the leader tag for a while
    backend.delete("relay/leader").await.unwrap();
    let intruder_session = members[intruder].membership.session_id().unwrap();
    assert!(backend.acquire("relay/leader", &intruder_session).await.unwrap());

    let mut settled = false;
    for _ in 0..60 {
        sleep(Duration::from_millis(100)).await;
        let current = leaders(&members);
        let holder = backend.lock_holder("relay/leader").await.unwrap();
        if current.len() == 1 && holder.is_some() {
            let winner = &members[current[0]].membership;
            if holder == winner.session_id() {
                settled = true;
                break;
            }
        }
    }
    assert!(settled, "cluster did not settle on one leader");

    for member in &members {
        member.shutdown.cancel();
    }
}
