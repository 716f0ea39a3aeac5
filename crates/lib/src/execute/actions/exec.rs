//! Running a process against a private copy of a container rootfs.
//!
//! The process gets a cleared environment:
//! - `PATH` from the image config, or a standard default
//! - the image's environment, then engine-provided variables, then the
//!   variables given on the exec itself
//! - `HOME=/homeless-shelter`, `TMPDIR` and friends pointing into scratch
//!   space, `LANG=C`, a fixed `SOURCE_DATE_EPOCH`
//! - `KILN_ROOTFS` pointing at the private rootfs
//!
//! The working directory is the image workdir inside the private rootfs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::{DEFAULT_PATH, ROOTFS_ENV, SOURCE_DATE_EPOCH};
use crate::events::{EngineEvent, LogStream};
use crate::execute::types::{ExecutionContext, FailureCause, ImageConfig};

/// Captured output beyond this many bytes per stream is dropped. Log events
/// still carry every line.
pub const MAX_CAPTURED_BYTES: usize = 1 << 20;

/// Appended to captured output that hit [`MAX_CAPTURED_BYTES`].
pub const TRUNCATION_NOTICE: &str = "[output truncated]\n";

#[derive(Debug, Clone)]
pub struct ProcessSpec<'a> {
  pub args: &'a [String],
  pub env: BTreeMap<String, String>,
  pub cwd: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
  pub exit_code: i32,
  pub stdout: String,
  pub stderr: String,
}

/// Assemble the environment for a process running in `rootfs`.
pub fn process_env(
  config: &ImageConfig,
  engine_env: &BTreeMap<String, String>,
  user_env: &BTreeMap<String, String>,
  rootfs: &Path,
  tmp: &Path,
) -> BTreeMap<String, String> {
  let mut env = BTreeMap::new();
  env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
  env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

  let tmp = tmp.to_string_lossy().to_string();
  for (key, value) in [
    ("HOME", "/homeless-shelter".to_string()),
    ("TMPDIR", tmp.clone()),
    ("TMP", tmp.clone()),
    ("TEMP", tmp.clone()),
    ("TEMPDIR", tmp),
    ("LANG", "C".to_string()),
    ("LC_ALL", "C".to_string()),
    ("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH.to_string()),
    (ROOTFS_ENV, rootfs.to_string_lossy().to_string()),
  ] {
    env.insert(key.to_string(), value);
  }

  env.extend(engine_env.iter().map(|(k, v)| (k.clone(), v.clone())));
  env.extend(user_env.iter().map(|(k, v)| (k.clone(), v.clone())));
  env
}

/// Spawn the process, stream its output as log events, and wait for it.
///
/// A non-zero exit is returned as data. The process is killed when the
/// context's timeout elapses or its token is cancelled.
pub async fn run_process(spec: &ProcessSpec<'_>, ctx: &ExecutionContext) -> Result<ProcessOutput, FailureCause> {
  let Some((program, args)) = spec.args.split_first() else {
    return Err(FailureCause::IsolationSetup("empty command".to_string()));
  };

  info!(node = %ctx.node.fingerprint.short(), cmd = %spec.args.join(" "), "executing process");

  let mut command = Command::new(program);
  command
    .args(args)
    .current_dir(&spec.cwd)
    .env_clear()
    .envs(&spec.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  debug!(program = %program, cwd = %spec.cwd.display(), "spawning process");

  let mut child = command
    .spawn()
    .map_err(|e| FailureCause::setup(format!("failed to spawn {}", program), e))?;

  let stdout = child.stdout.take();
  let stderr = child.stderr.take();

  let run = async {
    let (status, out, err) = tokio::join!(
      child.wait(),
      pump(stdout, LogStream::Stdout, ctx),
      pump(stderr, LogStream::Stderr, ctx),
    );
    (status, out, err)
  };

  let bounded = async {
    match ctx.timeout {
      Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| FailureCause::Timeout(limit)),
      None => Ok(run.await),
    }
  };

  let outcome = tokio::select! {
    outcome = bounded => outcome,
    _ = ctx.cancel.cancelled() => Err(FailureCause::Cancelled),
  };

  let (status, stdout, stderr) = match outcome {
    Ok(done) => done,
    Err(cause) => {
      let _ = child.kill().await;
      debug!(program = %program, cause = %cause, "process killed");
      return Err(cause);
    }
  };

  let status = status.map_err(|e| FailureCause::setup("failed to wait for process", e))?;
  let exit_code = exit_code(status);

  debug!(program = %program, exit_code, "process exited");

  Ok(ProcessOutput {
    exit_code,
    stdout,
    stderr,
  })
}

async fn pump<R>(reader: Option<R>, stream: LogStream, ctx: &ExecutionContext) -> String
where
  R: AsyncRead + Unpin,
{
  let Some(reader) = reader else {
    return String::new();
  };

  // Read raw lines so output that is not UTF-8 is still drained to EOF.
  // Stopping early would close the pipe under a running process.
  let mut reader = BufReader::new(reader);
  let mut buf = Vec::new();
  let mut capture = Capture::new(MAX_CAPTURED_BYTES);

  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf).await {
      Ok(0) => break,
      Ok(_) => {}
      Err(e) => {
        debug!(node = %ctx.node, ?stream, error = %e, "output stream read failed");
        break;
      }
    }

    let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw).into_owned();
    capture.push(&line);
    ctx.events.emit(EngineEvent::Log {
      node: ctx.node.clone(),
      stream,
      line,
    });
  }

  capture.finish()
}

/// Collects output lines up to a byte budget.
struct Capture {
  text: String,
  limit: usize,
  truncated: bool,
}

impl Capture {
  fn new(limit: usize) -> Self {
    Self {
      text: String::new(),
      limit,
      truncated: false,
    }
  }

  fn push(&mut self, line: &str) {
    if self.truncated {
      return;
    }
    if self.text.len() + line.len() + 1 > self.limit {
      self.truncated = true;
      return;
    }
    self.text.push_str(line);
    self.text.push('\n');
  }

  fn finish(mut self) -> String {
    if self.truncated {
      self.text.push_str(TRUNCATION_NOTICE);
    }
    self.text
  }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status
    .code()
    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
  status.code().unwrap_or(-1)
}
