use std::fs;
use std::time::Duration;

use kiln_lib::config::EngineConfig;
use kiln_lib::eval::ResolveError;
use kiln_lib::events::{EngineEvent, LogStream};
use kiln_lib::execute::{FailureCause, ResolvedResult};
use kiln_lib::filter::CopyFilter;
use kiln_lib::graph::{NodeRef, OperationKind};
use kiln_lib::image::{ImageSource, LocalImageSource};
use kiln_lib::registry::LocalRegistry;
use kiln_lib::session::script::PipelineScript;
use kiln_lib::session::{Session, SessionError};
use tokio_util::sync::CancellationToken;

use super::common::{TestEngine, args, drain, sh, started};

const REFERENCE: &str = "ttl.sh/hello-kiln";

struct Stages {
  test: NodeRef,
  build: NodeRef,
  site: NodeRef,
}

/// The two-stage web build: install, test and build in a node image, then
/// copy only `build/` into an nginx image.
fn two_stage(session: &Session, test_script: &str) -> Stages {
  let node = session.base("node:16-slim").unwrap();
  let source = session
    .mount(&node, "/src", ".", &args(&["node_modules/", "ci/"]))
    .unwrap();
  let runner = session.set_workdir(&source, "/src").unwrap();
  let install = session
    .exec(&runner, &sh("mkdir -p node_modules/left-pad && echo installed > node_modules/left-pad/index.js"))
    .unwrap();
  let test = session.exec(&install, &sh(test_script)).unwrap();
  let build = session
    .exec(&test, &sh("mkdir -p build && cp src/index.html build/ && echo \"node $NODE_VERSION\""))
    .unwrap();
  let dist = session.directory_node(&build, "./build").unwrap();

  let nginx = session.base("nginx:1.23-alpine").unwrap();
  let site = session
    .copy_into(&nginx, "/usr/share/nginx/html", &dist, CopyFilter::default())
    .unwrap();

  Stages { test, build, site }
}

const PASSING_TESTS: &str = "test -f package.json && test ! -d ci && echo ok";

#[tokio::test]
async fn two_stage_build_publishes_only_the_build_output() {
  let engine = TestEngine::new();
  let session = engine.session();
  let mut events = session.subscribe();
  let stages = two_stage(&session, PASSING_TESTS);

  let reference = session.publish(&stages.site, REFERENCE).await.unwrap();

  assert!(reference.starts_with("ttl.sh/hello-kiln:latest@sha256:"), "{}", reference);
  let events = drain(&mut events);
  assert_eq!(started(&events, OperationKind::Exec), 3);
  assert_eq!(started(&events, OperationKind::Publish), 1);

  let registry = LocalRegistry::new(engine.root().join("registry"));
  let manifest = registry.manifest(REFERENCE).unwrap();
  assert_eq!(manifest.config.workdir, "/");

  let pulled = LocalImageSource::new(engine.root().join("registry"))
    .pull(REFERENCE)
    .await
    .unwrap();
  let html = pulled.rootfs.join("usr/share/nginx/html");
  assert_eq!(fs::read_to_string(html.join("index.html")).unwrap(), "<h1>hello</h1>\n");
  assert!(html.join("50x.html").exists());
  assert!(!pulled.rootfs.join("src").exists());
  assert!(!pulled.rootfs.join("node_modules").exists());
}

#[tokio::test]
async fn rebuilding_an_unchanged_project_only_publishes() {
  let engine = TestEngine::new();
  let session = engine.session();
  let stages = two_stage(&session, PASSING_TESTS);
  let first = session.publish(&stages.site, REFERENCE).await.unwrap();

  let mut events = session.subscribe();
  let second = session.publish(&stages.site, REFERENCE).await.unwrap();

  assert_eq!(first, second);
  let events = drain(&mut events);
  assert_eq!(started(&events, OperationKind::Exec), 0);
  assert_eq!(started(&events, OperationKind::HostDirectory), 1);
  assert_eq!(started(&events, OperationKind::Publish), 1);
}

#[tokio::test]
async fn host_changes_rebuild_downstream_steps() {
  let engine = TestEngine::new();
  let session = engine.session();
  let stages = two_stage(&session, PASSING_TESTS);
  session.publish(&stages.site, REFERENCE).await.unwrap();

  engine.write_project("src/index.html", "<h1>hello again</h1>\n");
  let mut events = session.subscribe();
  session.publish(&stages.site, REFERENCE).await.unwrap();

  assert_eq!(started(&drain(&mut events), OperationKind::Exec), 3);
  let pulled = LocalImageSource::new(engine.root().join("registry"))
    .pull(REFERENCE)
    .await
    .unwrap();
  assert_eq!(
    fs::read_to_string(pulled.rootfs.join("usr/share/nginx/html/index.html")).unwrap(),
    "<h1>hello again</h1>\n"
  );
}

#[tokio::test]
async fn excluded_host_changes_do_not_rebuild() {
  let engine = TestEngine::new();
  let session = engine.session();
  let stages = two_stage(&session, PASSING_TESTS);
  session.publish(&stages.site, REFERENCE).await.unwrap();

  engine.write_project("node_modules/other/index.js", "new");
  engine.write_project("ci/deploy.json", "{}");
  let mut events = session.subscribe();
  session.publish(&stages.site, REFERENCE).await.unwrap();

  assert_eq!(started(&drain(&mut events), OperationKind::Exec), 0);
}

#[tokio::test]
async fn failing_tests_stop_the_pipeline() {
  let engine = TestEngine::new();
  let session = engine.session();
  let mut events = session.subscribe();
  let stages = two_stage(&session, "echo '1 test failed' >&2; exit 1");

  let err = session.publish(&stages.site, REFERENCE).await.unwrap_err();

  let SessionError::Resolve(ResolveError::ExecutionFailed { node, cause }) = err else {
    panic!("expected an execution failure, got {:?}", err);
  };
  assert_eq!(node.fingerprint, *stages.test.fingerprint());
  assert_eq!(
    cause,
    FailureCause::NonZeroExit {
      code: 1,
      stderr: "1 test failed\n".to_string(),
    }
  );

  let events = drain(&mut events);
  // install and test ran; build never did.
  assert_eq!(started(&events, OperationKind::Exec), 2);
  assert_eq!(started(&events, OperationKind::Publish), 0);
  assert!(LocalRegistry::new(engine.root().join("registry")).manifest(REFERENCE).is_none());

  // The failing step itself resolves to its exit status.
  let result = session.resolve(&stages.test).await.unwrap();
  assert_eq!(result.exit_code(), Some(1));
  assert!(session.resolve(&stages.build).await.is_err());
}

#[tokio::test]
async fn concurrent_requests_share_executions() {
  let engine = TestEngine::new();
  let session = engine.session();
  let mut events = session.subscribe();
  let stages = two_stage(&session, PASSING_TESTS);

  let (a, b) = tokio::join!(session.resolve(&stages.site), session.resolve(&stages.site));

  assert_eq!(a.unwrap(), b.unwrap());
  let events = drain(&mut events);
  assert_eq!(started(&events, OperationKind::Exec), 3);
  assert_eq!(started(&events, OperationKind::FromImage), 2);
}

#[tokio::test]
async fn process_output_is_streamed_and_captured() {
  let engine = TestEngine::new();
  let session = engine.session();
  let mut events = session.subscribe();
  let base = session.base("node:16-slim").unwrap();
  let run = session.exec(&base, &sh("echo hello; echo oops >&2")).unwrap();

  let result = session.resolve(&run).await.unwrap();

  let ResolvedResult::Exec { stdout, stderr, .. } = result else {
    panic!("expected an exec result");
  };
  assert_eq!(stdout, "hello\n");
  assert_eq!(stderr, "oops\n");

  let lines: Vec<(LogStream, String)> = drain(&mut events)
    .into_iter()
    .filter_map(|event| match event {
      EngineEvent::Log { stream, line, .. } => Some((stream, line)),
      _ => None,
    })
    .collect();
  assert!(lines.contains(&(LogStream::Stdout, "hello".to_string())));
  assert!(lines.contains(&(LogStream::Stderr, "oops".to_string())));
}

#[tokio::test]
async fn exec_timeout_is_an_execution_failure() {
  let engine = TestEngine::new();
  let session = Session::new(EngineConfig {
    exec_timeout: Some(Duration::from_millis(200)),
    ..engine.config()
  });
  let base = session.base("node:16-slim").unwrap();
  let slow = session.exec(&base, &args(&["/bin/sleep", "5"])).unwrap();

  let err = session.resolve(&slow).await.unwrap_err();

  assert!(matches!(
    err,
    SessionError::Resolve(ResolveError::ExecutionFailed {
      cause: FailureCause::Timeout(_),
      ..
    })
  ));
}

#[tokio::test]
async fn cancelled_requests_return_promptly() {
  let engine = TestEngine::new();
  let session = engine.session();
  let base = session.base("node:16-slim").unwrap();
  let slow = session.exec(&base, &args(&["/bin/sleep", "5"])).unwrap();
  let cancel = CancellationToken::new();

  let canceller = {
    let cancel = cancel.clone();
    async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      cancel.cancel();
    }
  };
  let (result, ()) = tokio::time::timeout(
    Duration::from_secs(3),
    async { tokio::join!(session.resolve_with_cancel(&slow, cancel), canceller) },
  )
  .await
  .unwrap();

  assert!(matches!(result, Err(SessionError::Resolve(ResolveError::Cancelled))));
  assert!(!session.cache().contains(slow.fingerprint()));
}

#[tokio::test]
async fn pipeline_script_runs_the_two_stage_build() {
  let engine = TestEngine::new();
  let session = engine.session();
  let script = PipelineScript::parse(
    r#"{
      "steps": [
        { "name": "node", "call": "base", "image": "node:16-slim" },
        { "name": "source", "call": "mount", "container": "node", "path": "/src",
          "host_path": ".", "exclude": ["node_modules/", "ci/"] },
        { "name": "runner", "call": "set_workdir", "container": "source", "path": "/src" },
        { "name": "test", "call": "exec", "container": "runner", "args": ["/bin/sh", "-c", "test -f package.json"] },
        { "name": "build", "call": "exec", "container": "test",
          "args": ["/bin/sh", "-c", "mkdir -p build && cp src/index.html build/"] },
        { "name": "dist", "call": "directory", "container": "build", "path": "./build" },
        { "name": "nginx", "call": "base", "image": "nginx:1.23-alpine" },
        { "name": "site", "call": "copy_into", "container": "nginx",
          "path": "/usr/share/nginx/html", "directory": "dist" },
        { "name": "image", "call": "publish", "container": "site", "reference": "ttl.sh/hello-kiln" }
      ]
    }"#,
  )
  .unwrap();

  let outcomes = script.run(&session).await.unwrap();

  assert_eq!(outcomes.len(), 9);
  let dist = &outcomes[5];
  assert!(dist.output.as_deref().unwrap().starts_with("directory "));
  let image = outcomes.last().unwrap();
  assert!(image.output.as_deref().unwrap().starts_with("ttl.sh/hello-kiln:latest@sha256:"));
  assert!(outcomes[..5].iter().all(|o| o.output.is_none()));
}
