use std::fs;

use kiln_lib::cache::CachePolicy;
use kiln_lib::config::EngineConfig;
use kiln_lib::gc::collect_garbage;
use kiln_lib::graph::{NodeRef, OperationKind};
use kiln_lib::session::Session;

use super::common::{TestEngine, drain, sh, started};

fn build(session: &Session) -> NodeRef {
  let base = session.base("node:16-slim").unwrap();
  let workdir = session.set_workdir(&base, "/app").unwrap();
  session.exec(&workdir, &sh("echo built > out.txt")).unwrap()
}

#[tokio::test]
async fn persisted_results_are_reused_by_later_sessions() {
  let engine = TestEngine::new();
  {
    let session = engine.session();
    session.resolve(&build(&session)).await.unwrap();
  }

  let session = engine.session();
  assert!(!session.cache().is_empty());
  let mut events = session.subscribe();
  let result = session.resolve(&build(&session)).await.unwrap();

  let events = drain(&mut events);
  assert_eq!(started(&events, OperationKind::Exec), 0);
  assert_eq!(started(&events, OperationKind::FromImage), 0);
  let (rootfs, _) = result.container().unwrap();
  assert_eq!(fs::read_to_string(rootfs.path.join("app/out.txt")).unwrap(), "built\n");
}

#[tokio::test]
async fn entries_with_missing_snapshots_are_rebuilt() {
  let engine = TestEngine::new();
  {
    let session = engine.session();
    session.resolve(&build(&session)).await.unwrap();
  }
  fs::remove_dir_all(engine.root().join("snapshots")).unwrap();

  let session = engine.session();
  assert!(session.cache().is_empty());
  let mut events = session.subscribe();
  session.resolve(&build(&session)).await.unwrap();

  assert_eq!(started(&drain(&mut events), OperationKind::Exec), 1);
}

#[tokio::test]
async fn ephemeral_sessions_start_cold() {
  let engine = TestEngine::new();
  let config = EngineConfig {
    persist_cache: false,
    ..engine.config()
  };
  {
    let session = Session::new(config.clone());
    session.resolve(&build(&session)).await.unwrap();
  }

  let session = Session::new(config);
  let mut events = session.subscribe();
  session.resolve(&build(&session)).await.unwrap();

  assert_eq!(started(&drain(&mut events), OperationKind::Exec), 1);
  assert!(!engine.root().join("cache").exists());
}

#[tokio::test]
async fn gc_keeps_cached_snapshots_and_sweeps_the_rest() {
  let engine = TestEngine::new();
  let session = engine.session();
  let node = build(&session);
  session.resolve(&node).await.unwrap();
  let cached = session.snapshots().list().unwrap().len();
  assert!(cached > 0);

  let kept = collect_garbage(session.cache(), session.snapshots(), false).unwrap();
  assert_eq!(kept.stats.snapshots_deleted, 0);
  assert_eq!(session.snapshots().list().unwrap().len(), cached);

  session.cache().clear();
  let swept = collect_garbage(session.cache(), session.snapshots(), false).unwrap();
  assert_eq!(swept.stats.snapshots_deleted, cached);
  assert!(session.snapshots().list().unwrap().is_empty());

  // Everything can be rebuilt afterwards.
  let mut events = session.subscribe();
  session.resolve(&node).await.unwrap();
  assert_eq!(started(&drain(&mut events), OperationKind::Exec), 1);
}

#[tokio::test]
async fn eviction_honours_the_entry_bound() {
  let engine = TestEngine::new();
  let session = Session::new(EngineConfig {
    cache_policy: CachePolicy {
      max_entries: Some(1),
      ..CachePolicy::default()
    },
    ..engine.config()
  });
  let node = build(&session);
  session.resolve(&node).await.unwrap();
  // from, with_workdir and exec.
  assert_eq!(session.cache().len(), 3);

  let stats = session.cache().evict();

  assert_eq!(stats.evicted, 2);
  assert_eq!(session.cache().len(), 1);
  // The most recently used entry is the exec result.
  assert!(session.cache().contains(node.fingerprint()));
}
