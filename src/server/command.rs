//! Invocation of the `initdb` and `pg_ctl` command-line tools.
//!
//! Output is forwarded line by line to `tracing` from detached reader
//! threads. The postmaster inherits `pg_ctl`'s pipes, so a started server
//! keeps them open; callers therefore only ever wait on the exit status.

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::ProcessOutput;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::observability::LOG_TARGET;
use crate::platform::linux;

/// Fixed superuser created by `initdb`.
pub(crate) const SUPERUSER: &str = "postgres";

/// Seconds `pg_ctl stop` waits for the server to exit.
const STOP_WAIT_SECS: &str = "5";

/// Lines of tool output retained for error messages.
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy)]
enum Tool {
    InitDb,
    PgCtl,
}

impl Tool {
    const fn name(self) -> &'static str {
        match self {
            Self::InitDb => "initdb",
            Self::PgCtl => "pg_ctl",
        }
    }
}

/// Runs the tools found in one extracted binary directory.
#[derive(Debug, Clone)]
pub(crate) struct PgTools {
    bin_dir: Utf8PathBuf,
    output: ProcessOutput,
}

impl PgTools {
    pub(crate) fn new(pg_dir: &Utf8Path, output: ProcessOutput) -> Self {
        Self {
            bin_dir: pg_dir.join("bin"),
            output,
        }
    }

    /// Initialises `data_dir` with trust authentication and UTF-8 encoding.
    pub(crate) fn initdb(&self, data_dir: &Utf8Path, locale: &BTreeMap<String, String>) -> Result<()> {
        let mut args = vec![
            "-A".to_owned(),
            "trust".to_owned(),
            "-U".to_owned(),
            SUPERUSER.to_owned(),
            "-D".to_owned(),
            data_dir.to_string(),
            "-E".to_owned(),
            "UTF-8".to_owned(),
        ];
        args.extend(locale.iter().map(|(key, value)| format!("--{key}={value}")));
        self.run(Tool::InitDb, &args, None)
    }

    /// Starts the postmaster and waits for readiness at most `wait`.
    pub(crate) fn start(
        &self,
        data_dir: &Utf8Path,
        port: u16,
        server_config: &BTreeMap<String, String>,
        wait: Duration,
    ) -> Result<()> {
        let args = [
            "-D".to_owned(),
            data_dir.to_string(),
            "-o".to_owned(),
            server_options(port, server_config),
            "-w".to_owned(),
            "start".to_owned(),
        ];
        self.run(Tool::PgCtl, &args, Some(wait))
    }

    /// Requests a fast shutdown, letting `pg_ctl` wait up to five seconds.
    pub(crate) fn stop(&self, data_dir: &Utf8Path) -> Result<()> {
        let args = [
            "-D".to_owned(),
            data_dir.to_string(),
            "stop".to_owned(),
            "-m".to_owned(),
            "fast".to_owned(),
            "-t".to_owned(),
            STOP_WAIT_SECS.to_owned(),
            "-w".to_owned(),
        ];
        self.run(Tool::PgCtl, &args, None)
    }

    fn command(&self, tool: Tool) -> Command {
        let executable = self
            .bin_dir
            .join(format!("{}{}", tool.name(), std::env::consts::EXE_SUFFIX));
        if linux::unshare_available() {
            let mut command = Command::new("unshare");
            command.arg("-U").arg(executable.as_std_path());
            command
        } else {
            Command::new(executable.as_std_path())
        }
    }

    fn run(&self, tool: Tool, args: &[String], timeout: Option<Duration>) -> Result<()> {
        let mut command = self.command(tool);
        command.args(args).stdin(Stdio::null());
        self.output.apply(&mut command);
        debug!(target: LOG_TARGET, tool = tool.name(), ?args, "running postgres tool");

        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("failed to spawn {}", tool.name()))
            .kind(ErrorKind::ProcessFailed)?;
        let mut capture = OutputCapture::forward(&mut child, tool)?;

        let status = match timeout {
            None => child
                .wait()
                .wrap_err_with(|| format!("failed to wait for {}", tool.name()))
                .kind(ErrorKind::ProcessFailed)?,
            Some(limit) => wait_bounded(&mut child, tool, limit, &capture)?,
        };
        // Only the start path leaves a postmaster holding the pipes open.
        if timeout.is_none() {
            capture.join();
        }
        check_status(tool, status, &capture)
    }
}

fn wait_bounded(
    child: &mut Child,
    tool: Tool,
    limit: Duration,
    capture: &OutputCapture,
) -> Result<ExitStatus> {
    match child.wait_timeout(limit) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            terminate(child, tool);
            Err(Error::new(
                ErrorKind::StartTimeout,
                eyre!(
                    "process {} timed out after {limit:?}{}",
                    tool.name(),
                    capture.render_tail()
                ),
            ))
        }
        Err(err) => {
            terminate(child, tool);
            Err(Error::new(
                ErrorKind::ProcessFailed,
                eyre!("failed to wait for {}: {err}", tool.name()),
            ))
        }
    }
}

fn terminate(child: &mut Child, tool: Tool) {
    if let Err(err) = child.kill() {
        warn!(target: LOG_TARGET, tool = tool.name(), error = %err, "failed to kill timed-out process");
    }
    drop(child.wait());
}

fn check_status(tool: Tool, status: ExitStatus, capture: &OutputCapture) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let code = status
        .code()
        .map_or_else(|| "signal".to_owned(), |code| code.to_string());
    Err(Error::new(
        ErrorKind::ProcessFailed,
        eyre!(
            "process {} failed with exit code {code}{}",
            tool.name(),
            capture.render_tail()
        ),
    ))
}

/// Builds the `-o` option string passed through `pg_ctl` to the postmaster.
fn server_options(port: u16, server_config: &BTreeMap<String, String>) -> String {
    let mut options = vec!["-p".to_owned(), port.to_string(), "-F".to_owned()];
    for (key, value) in server_config {
        options.push("-c".to_owned());
        options.push(format!("{key}={value}"));
    }
    options.join(" ")
}

impl ProcessOutput {
    fn apply(self, command: &mut Command) {
        let (stdout, stderr) = match self {
            Self::Log => (Stdio::piped(), Stdio::piped()),
            Self::Inherit => (Stdio::inherit(), Stdio::inherit()),
            Self::Discard => (Stdio::null(), Stdio::null()),
        };
        command.stdout(stdout).stderr(stderr);
    }
}

type Tail = Arc<Mutex<VecDeque<String>>>;

/// Reader threads draining a child's piped output into the log.
struct OutputCapture {
    tail: Tail,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    fn forward(child: &mut Child, tool: Tool) -> Result<Self> {
        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tool, "stdout", Arc::clone(&tail))?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tool, "stderr", Arc::clone(&tail))?);
        }
        Ok(Self { tail, readers })
    }

    fn join(&mut self) {
        for reader in self.readers.drain(..) {
            drop(reader.join());
        }
    }

    fn render_tail(&self) -> String {
        let tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            return String::new();
        }
        let lines: Vec<&str> = tail.iter().map(String::as_str).collect();
        format!("\noutput:\n{}", lines.join("\n"))
    }
}

fn spawn_reader<R>(stream: R, tool: Tool, stream_name: &'static str, tail: Tail) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let reader = thread::Builder::new()
        .name(format!("{}-{stream_name}", tool.name()))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else {
                    break;
                };
                debug!(target: LOG_TARGET, tool = tool.name(), stream = stream_name, "{line}");
                let mut retained = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if retained.len() == OUTPUT_TAIL_LINES {
                    retained.pop_front();
                }
                retained.push_back(line);
            }
        })
        .wrap_err_with(|| format!("failed to spawn {} output reader", tool.name()))?;
    Ok(reader)
}
