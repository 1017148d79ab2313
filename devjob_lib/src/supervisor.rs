use std::{
    collections::BTreeMap,
    fs::File,
    io,
    os::unix::io::FromRawFd,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use devjob_data::Job;
use serde_json::Value;
use tokio::{
    fs::OpenOptions,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
    process::{Child, Command},
    sync::mpsc::{self, Receiver, Sender},
    time::timeout,
};
use tracing::{error, info, instrument, warn};

use crate::{
    notify::Notifier,
    prompt::respond_to_prompts,
    registry::JobRegistry,
    util::{exit_code_of, wait_until_gone, ABNORMAL_EXIT_CODE},
    workspace::{JobPaths, Workspace},
};

const RELAY_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

/// A running job script and the read end of the pipe it writes both
/// stdout and stderr to.
pub struct JobProcess {
    pub child: Child,
    pub output: pipe::Receiver,
}

impl JobProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// one pipe shared by fd 1 and 2 keeps the child's write order
fn output_pipe() -> io::Result<(pipe::Receiver, File)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    #[allow(unsafe_code)]
    let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(unsafe_code)]
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok((pipe::Receiver::from_file(read)?, write))
}

/// launches the job script in its own process group so the whole tree can be signalled
pub fn spawn(paths: &JobPaths, env: &BTreeMap<String, String>, interactive: bool) -> io::Result<JobProcess> {
    let stdin = if interactive {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let (output, stdout) = output_pipe()?;
    let stderr = stdout.try_clone()?;
    // the command owns the write ends and drops them right after the spawn,
    // so the reader sees EOF once the child side closes
    let child = Command::new("/bin/bash")
        .arg(&paths.script)
        .current_dir(&paths.workspace)
        .envs(env)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()?;
    Ok(JobProcess { child, output })
}

/// Watches job processes until they exit and records the outcome.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<JobRegistry>,
    workspace: Workspace,
    notifier: Notifier,
    drain_grace: Duration,
    poll: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        workspace: Workspace,
        notifier: Notifier,
        drain_grace: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            registry,
            workspace,
            notifier,
            drain_grace,
            poll,
        }
    }

    /// Relays the job's output into its log, answers prompts and waits for the
    /// exit, then finalizes the job. All of it is one unit: when this future
    /// is dropped the reader, the log writer and the responder go with it.
    #[instrument(skip_all, fields(job_id = %job.job_id))]
    pub async fn supervise(self, process: JobProcess, job: Job, output: PathBuf) {
        let JobProcess {
            child: mut process,
            output: combined,
        } = process;
        let stdin = process.stdin.take();
        let password = job
            .repo
            .get("password")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (log_tx, log_rx) = mpsc::channel(RELAY_CAPACITY);
        let (prompt_tx, prompt_rx) = match stdin {
            Some(_) => {
                let (tx, rx) = mpsc::channel(RELAY_CAPACITY);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let job_id = job.job_id.clone();
        let relay = async {
            let (_, written) = tokio::join!(
                read_pipe(combined, log_tx, prompt_tx),
                write_log(&output, log_rx),
            );
            if let Err(err) = written {
                error!("could not write output log {}: {}", output.display(), err);
            }
        };
        let responder = async {
            if let (Some(stdin), Some(prompt_rx)) = (stdin, prompt_rx) {
                respond_to_prompts(job_id, stdin, password, prompt_rx).await;
            }
        };

        let status = {
            let io = async {
                tokio::join!(relay, responder);
            };
            tokio::pin!(io);
            let mut io_done = false;
            let status = loop {
                tokio::select! {
                    status = process.wait() => break status,
                    _ = &mut io, if !io_done => io_done = true,
                }
            };
            // descendants may still hold the pipe after the script itself is gone
            if !io_done && timeout(self.drain_grace, &mut io).await.is_err() {
                warn!(
                    "output pipe still open {:?} after exit, detaching relay",
                    self.drain_grace
                );
            }
            status
        };

        let exit_code = match status {
            Ok(status) => exit_code_of(status),
            Err(err) => {
                error!("waiting for job process failed: {}", err);
                if let Some(pid) = job.pid {
                    wait_until_gone(pid, self.poll).await;
                }
                ABNORMAL_EXIT_CODE
            }
        };
        self.finish(job, exit_code, false).await;
    }

    /// Records the exit code of a job whose process is gone.
    ///
    /// The running entry is removed before the metadata is rewritten, both
    /// under the registry lock, so nobody sees the job running in memory and
    /// finished on disk at once.
    pub async fn finish(&self, mut job: Job, exit_code: i32, reconciled: bool) {
        job.exit_code = Some(exit_code);
        job.finished_at = Some(Utc::now());
        job.reconciled = reconciled;
        {
            let mut registry = self.registry.lock().await;
            let running_pid = registry.find(&job.job_id).map(|running| running.pid);
            match running_pid {
                Some(pid) if pid == job.pid => {
                    registry.remove(&job.job_id);
                }
                Some(_) => {
                    warn!(
                        "job id {} was reused by a newer job, not recording the old result",
                        job.job_id
                    );
                    return;
                }
                None => {}
            }
            if let Err(err) = self.workspace.write_metadata(&job).await {
                error!("could not persist result of job {}: {}", job.job_id, err);
            }
        }
        info!("job {} finished with exit code {}", job.job_id, exit_code);
        if let Some(callback) = &job.callback {
            self.notifier.notify(callback, &job.job_id, exit_code);
        }
    }
}

/// forwards the pipe chunk by chunk, and keeps draining it even when nobody listens
async fn read_pipe<R: AsyncRead + Unpin>(
    mut pipe: R,
    log: Sender<Vec<u8>>,
    prompts: Option<Sender<Vec<u8>>>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut log_open = true;
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("reading job output failed: {}", err);
                break;
            }
        };
        let chunk = buf[..n].to_vec();
        if let Some(prompts) = &prompts {
            let _ = prompts.send(chunk.clone()).await;
        }
        if log_open && log.send(chunk).await.is_err() {
            warn!("output log writer is gone, discarding job output");
            log_open = false;
        }
    }
}

/// sole writer of the output log, finishes once the reader hung up
async fn write_log(output: &Path, mut chunks: Receiver<Vec<u8>>) -> io::Result<()> {
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .await?;
    while let Some(chunk) = chunks.recv().await {
        log.write_all(&chunk).await?;
        log.flush().await?;
    }
    Ok(())
}
