use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::config::AdjustConfig;
use crate::mem::MemSwarm;
use crate::net::visit_fn;

const LOCAL: PeerId = PeerId::new([0; 32]);
const TIMEOUT: Duration = Duration::from_secs(10);

fn id(i: u8) -> BlockId {
    BlockId::new([i; 32])
}

fn peer(i: u8) -> PeerId {
    PeerId::new([i; 32])
}

fn leaf(i: u8) -> Node {
    Node::new(id(i), format!("block {i}"))
}

fn root(children: impl IntoIterator<Item = u8>) -> Node {
    Node::new(id(0), "root").with_children(children.into_iter().map(id))
}

fn config() -> DispatchConfig {
    DispatchConfig::default()
        .with_discovery_interval(Duration::from_millis(10))
        .with_adjust(AdjustConfig::default().with_base_tolerate(Duration::from_millis(100)))
}

/// A visitor recording the ids of visited nodes, in order.
fn recorder() -> (Arc<Mutex<Vec<BlockId>>>, impl Visitor) {
    let visited = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&visited);

    let visitor = visit_fn(move |node: &Node| {
        recorded.lock().unwrap().push(node.id());
        Ok(())
    });

    (visited, visitor)
}

fn assert_visited_once(visited: &[BlockId], expected: impl IntoIterator<Item = u8>) {
    let expected: HashSet<_> = expected.into_iter().map(id).collect();

    assert_eq!(visited.len(), expected.len(), "{visited:?}");
    assert_eq!(visited.iter().copied().collect::<HashSet<_>>(), expected);
}

async fn dispatch(dispatcher: &Dispatcher) -> Result<(), Error> {
    tokio::time::timeout(TIMEOUT, dispatcher.dispatch()).await.expect("dispatch timed out")
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_overlapping_providers() {
    let swarm = MemSwarm::new(LOCAL);
    let nodes = [leaf(1), leaf(2), leaf(3)];

    swarm.add_provider(peer(1), &nodes[..2]);
    swarm.add_provider(peer(2), &nodes[1..]);

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=3), visitor, config());

    assert!(dispatch(&dispatcher).await.is_ok());

    let visited = visited.lock().unwrap().clone();
    assert_eq!(visited[0], id(0));
    assert_visited_once(&visited, 0..=3);

    assert_eq!(dispatcher.outstanding(), 0);
    assert!(dispatcher.monitor().redundant() <= 1);
    assert_eq!(dispatcher.monitor().collected(), 3);
    assert!((1..=3).all(|i| dispatcher.state(&id(i)) == Some(BlockState::Filled)));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_end_of_dag() {
    let swarm = MemSwarm::new(LOCAL);
    swarm.add_provider(peer(1), &[leaf(1)]);

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root([]), visitor, config());

    assert!(matches!(dispatch(&dispatcher).await, Err(Error::EndOfDag)));
    assert_eq!(*visited.lock().unwrap(), vec![id(0)]);
    assert!(swarm.requests().is_empty());
    assert!(logs_contain("Dispatching"));

    assert!(matches!(dispatch(&dispatcher).await, Err(Error::AlreadyDispatched)));
    assert_eq!(visited.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_nested_dag() {
    // 0 -> {1, 2}, 1 -> {3, 4}, 2 -> {5}, 4 -> {6}
    let parents = [(1, 0), (2, 0), (3, 1), (4, 1), (5, 2), (6, 4)];
    let nodes = [
        leaf(1).with_children([id(3), id(4)]),
        leaf(2).with_children([id(5)]),
        leaf(3),
        leaf(4).with_children([id(6)]),
        leaf(5),
        leaf(6),
    ];

    let swarm = MemSwarm::new(LOCAL);
    swarm.add_provider(peer(1), &nodes[..4]);
    swarm.add_provider(peer(2), &nodes[2..]);
    swarm.add_provider(peer(3), nodes.iter().step_by(2));

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=2), visitor, config());

    assert!(dispatch(&dispatcher).await.is_ok());

    let visited = visited.lock().unwrap().clone();
    assert_visited_once(&visited, 0..=6);

    // children are only known once their parent has been visited
    let position = |i| visited.iter().position(|visited| *visited == id(i)).unwrap();
    for (child, parent) in parents {
        assert!(position(parent) < position(child), "{child} visited before {parent}");
    }

    assert_eq!(dispatcher.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_many_peers() {
    const BLOCKS: u8 = 60;
    const PEERS: u8 = 5;

    let nodes: Vec<_> = (1..=BLOCKS).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    // every block is held by all peers but one
    for p in 1..=PEERS {
        swarm.add_provider(peer(p), nodes.iter().filter(|node| node.id().0[0] % PEERS != p - 1));
    }

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=BLOCKS), visitor, config());

    assert!(dispatch(&dispatcher).await.is_ok());

    assert_visited_once(&visited.lock().unwrap(), 0..=BLOCKS);
    assert_eq!(dispatcher.outstanding(), 0);

    let report = dispatcher.monitor().report();
    assert_eq!(report.collected, BLOCKS as usize);
    // workers still running on completion are aborted before reporting
    assert!(report.effects.values().sum::<usize>() <= BLOCKS as usize);
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_cancel() {
    let swarm = MemSwarm::new(LOCAL);
    swarm.add_provider(peer(1), &[leaf(1), leaf(2)]);
    swarm.set_latency(peer(1), Duration::from_secs(3_600));

    let (visited, visitor) = recorder();
    let config = config().with_adjust(AdjustConfig::default().with_base_tolerate(Duration::from_secs(3_600)));
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=2), visitor, config);
    let scope = dispatcher.scope();

    let (result, _) = tokio::join!(dispatch(&dispatcher), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        scope.cancel();
    });

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(*visited.lock().unwrap(), vec![id(0)]);
    assert_eq!(dispatcher.outstanding(), 2);
    assert!(!swarm.requests().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_visitor_error() {
    let swarm = MemSwarm::new(LOCAL);
    swarm.add_provider(peer(1), &[leaf(1), leaf(2)]);

    let visitor = visit_fn(|node: &Node| {
        if node.id() == id(2) {
            return Err("cannot store block".into());
        }
        Ok(())
    });
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=2), visitor, config());

    match dispatch(&dispatcher).await {
        Err(Error::Visit { id: failed, source }) => {
            assert_eq!(failed, id(2));
            assert_eq!(source.to_string(), "cannot store block");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert_ne!(dispatcher.state(&id(2)), Some(BlockState::Filled));
    assert!(dispatcher.outstanding() > 0);
}

#[tokio::test]
async fn test_root_visitor_error() {
    let swarm = MemSwarm::new(LOCAL);
    swarm.add_provider(peer(1), &[leaf(1)]);

    let visitor = visit_fn(|_: &Node| Err("full".into()));
    let dispatcher = Dispatcher::with_config(swarm.network(), root([1]), visitor, config());

    assert!(matches!(dispatch(&dispatcher).await, Err(Error::Visit { id: failed, .. }) if failed == id(0)));
    assert!(swarm.requests().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_co_worker_discovery() {
    let nodes: Vec<_> = (1..=4).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    // only peer 1 is advertised network-wide, but it has nothing and only knows about peer 2
    swarm.add_provider(peer(1), std::iter::empty());
    swarm.set_known(peer(1), [peer(2)]);
    swarm.add_peer(peer(2), &nodes);

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=4), visitor, config());

    assert!(dispatch(&dispatcher).await.is_ok());

    assert_visited_once(&visited.lock().unwrap(), 0..=4);
    assert!(swarm.requests().iter().any(|(requested, _)| *requested == peer(2)));

    let announcements = swarm.announcements();
    assert!(announcements.contains(&peer(1)));
    assert!(announcements.contains(&peer(2)));
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_unreachable_peer() {
    let nodes: Vec<_> = (1..=3).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    swarm.add_provider(peer(1), &nodes);
    swarm.set_unreachable(peer(1), true);
    swarm.add_provider(peer(2), &nodes);

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=3), visitor, config());

    assert!(dispatch(&dispatcher).await.is_ok());

    assert_visited_once(&visited.lock().unwrap(), 0..=3);
    assert!(swarm.requests().iter().all(|(requested, _)| *requested == peer(2)));
    assert_eq!(dispatcher.monitor().collected(), 3);
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_local_peer_skipped() {
    let nodes: Vec<_> = (1..=3).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    swarm.add_provider(LOCAL, &nodes);
    swarm.add_provider(peer(1), &nodes);

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=3), visitor, config());

    assert!(dispatch(&dispatcher).await.is_ok());

    assert_visited_once(&visited.lock().unwrap(), 0..=3);
    assert!(swarm.requests().iter().all(|(requested, _)| *requested != LOCAL));
    assert!(!swarm.announcements().contains(&LOCAL));
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_slow_peer() {
    let nodes: Vec<_> = (1..=8).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    swarm.add_provider(peer(1), &nodes);
    swarm.set_latency(peer(1), Duration::from_secs(5));
    swarm.add_provider(peer(2), &nodes);

    let (visited, visitor) = recorder();
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=8), visitor, config());

    let start = Instant::now();
    assert!(dispatch(&dispatcher).await.is_ok());
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_visited_once(&visited.lock().unwrap(), 0..=8);
    assert_eq!(dispatcher.monitor().collected(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let nodes: Vec<_> = (1..=5).map(leaf).collect();

    let swarm = MemSwarm::new(LOCAL);
    swarm.add_provider(peer(1), &nodes[..3]);
    swarm.add_provider(peer(2), &nodes[2..]);

    let path = dir.path().to_owned();
    let visitor = visit_fn(move |node: &Node| {
        std::fs::write(path.join(node.id().to_string()), node.payload())?;
        Ok(())
    });

    tokio::time::timeout(TIMEOUT, fetch(swarm.network(), root(1..=5), visitor))
        .await
        .expect("fetch timed out")
        .unwrap();

    let read = |path: &Path, i| std::fs::read(path.join(id(i).to_string())).unwrap();

    assert_eq!(read(dir.path(), 0), b"root");
    for node in &nodes {
        assert_eq!(read(dir.path(), node.id().0[0]), node.payload().as_ref());
    }
}

#[test]
fn test_registry_operations() {
    let swarm = MemSwarm::new(LOCAL);
    let dispatcher = Dispatcher::new(swarm.network(), root([]), visit_fn(|_: &Node| Ok(())));

    assert_eq!(dispatcher.register_blocks([id(1), id(2), id(2)]), vec![id(1), id(2)]);
    assert!(dispatcher.register_blocks([id(1)]).is_empty());
    assert_eq!(dispatcher.state(&id(1)), Some(BlockState::Empty));
    assert_eq!(dispatcher.state(&id(9)), None);
    assert_eq!(dispatcher.outstanding(), 2);

    assert_eq!(dispatcher.allocate(&[id(2), id(1)], 1), Ok(vec![id(2)]));
    assert_eq!(dispatcher.state(&id(2)), Some(BlockState::Pending));

    assert_eq!(dispatcher.mark_filled(id(2)), Ok(Fill::Filled { outstanding: 1 }));
    assert_eq!(dispatcher.mark_filled(id(2)), Ok(Fill::Redundant));
    assert_eq!(dispatcher.outstanding(), 1);

    assert_eq!(dispatcher.allocate(&[id(9), id(1)], 2), Err(AllocateError::UnknownBlock(id(9))));
    assert_eq!(dispatcher.state(&id(1)), Some(BlockState::Empty));
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_empty_peer_not_flooded() {
    let nodes: Vec<_> = (1..=4).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    swarm.add_provider(peer(1), std::iter::empty());
    swarm.add_provider(peer(2), &nodes);
    swarm.set_latency(peer(2), Duration::from_millis(50));

    let (visited, visitor) = recorder();
    let config = config().with_adjust(AdjustConfig::default().with_base_tolerate(Duration::from_millis(300)));
    let dispatcher = Dispatcher::with_config(swarm.network(), root(1..=4), visitor, config);

    assert!(dispatch(&dispatcher).await.is_ok());
    assert_visited_once(&visited.lock().unwrap(), 0..=4);

    // a round with nothing sent back still lasts until the idle timer fires
    let empty_requests = swarm.requests().iter().filter(|(requested, _)| *requested == peer(1)).count();
    assert!(empty_requests <= 5, "{empty_requests} requests sent to a peer holding nothing");
}

#[tokio::test(flavor = "multi_thread")]
#[tracing_test::traced_test]
async fn test_zero_pending_fallback_limit() {
    let nodes: Vec<_> = (1..=3).map(leaf).collect();
    let swarm = MemSwarm::new(LOCAL);

    // peer 1 claims every block in its first round but only holds one
    swarm.add_provider(peer(1), &nodes[..1]);
    swarm.add_provider(peer(2), &nodes);

    let config = config().with_pending_fallback_limit(0);
    let (visited, visitor) = recorder();
    let root = root(1..=3).with_size(30 * config.block_size);
    let dispatcher = Dispatcher::with_config(swarm.network(), root, visitor, config);

    assert!(dispatch(&dispatcher).await.is_ok());

    assert_visited_once(&visited.lock().unwrap(), 0..=3);
    assert_eq!(dispatcher.outstanding(), 0);
    assert!((1..=3).all(|i| dispatcher.state(&id(i)) == Some(BlockState::Filled)));
}
