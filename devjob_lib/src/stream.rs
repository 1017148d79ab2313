use std::{
    collections::VecDeque,
    io,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use devjob_data::Job;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
    time::{sleep, sleep_until, Instant},
};

use crate::util::is_pid_alive;

const TAIL_BLOCK: usize = 8192;
const FOLLOW_CHUNK: usize = 8192;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamItem {
    Output(String),
    /// nothing was written for a whole heartbeat period
    Heartbeat,
}

/// What a follower waits on before it declares the output complete.
#[derive(Clone, Debug)]
pub struct Follow {
    pub pid: u32,
    /// job metadata, the output is complete once it records an exit code
    pub metadata: PathBuf,
    /// how long to keep reading after the pid is gone when the metadata never
    /// records the exit
    pub settle: Duration,
}

/// Reads a job's output log like `tail -n <lines>`, and `tail -f --pid`
/// while the job process is alive.
pub struct OutputFollower {
    file: File,
    backlog: VecDeque<String>,
    /// `None` once there is nothing more to wait for
    follow: Option<Follow>,
    heartbeat: Duration,
    poll: Duration,
    last_activity: Instant,
    dead_since: Option<Instant>,
    buf: Vec<u8>,
    /// bytes of a character whose rest has not been written yet
    pending: Vec<u8>,
}

impl OutputFollower {
    /// Starts at the last `lines` lines of `output`. With a `follow` the
    /// follower keeps going until the job's exit is recorded and the file is
    /// drained.
    pub async fn open(
        output: &Path,
        lines: usize,
        follow: Option<Follow>,
        heartbeat: Duration,
        poll: Duration,
    ) -> io::Result<Self> {
        let mut file = File::open(output).await?;
        let len = file.metadata().await?.len();
        let offset = tail_offset(&mut file, len, lines).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut pending = vec![0u8; (len - offset) as usize];
        file.read_exact(&mut pending).await?;
        let text = if follow.is_some() {
            decode_utf8(&mut pending)
        } else {
            String::from_utf8_lossy(&std::mem::take(&mut pending)).into_owned()
        };
        let backlog = text.split_inclusive('\n').map(str::to_string).collect();
        Ok(Self {
            file,
            backlog,
            follow,
            heartbeat,
            poll,
            last_activity: Instant::now(),
            dead_since: None,
            buf: vec![0u8; FOLLOW_CHUNK],
            pending,
        })
    }

    /// Next piece of output or heartbeat, `None` at the end.
    ///
    /// The file poll and the heartbeat timer race inside this one future, so
    /// dropping it stops both.
    pub async fn next(&mut self) -> io::Result<Option<StreamItem>> {
        if let Some(line) = self.backlog.pop_front() {
            self.last_activity = Instant::now();
            return Ok(Some(StreamItem::Output(line)));
        }
        if self.follow.is_none() {
            return Ok(self.flush());
        }
        let deadline = self.last_activity + self.heartbeat;
        let appended = tokio::select! {
            appended = self.read_appended() => Some(appended?),
            _ = sleep_until(deadline) => None,
        };
        self.last_activity = Instant::now();
        match appended {
            None => Ok(Some(StreamItem::Heartbeat)),
            Some(Some(text)) => Ok(Some(StreamItem::Output(text))),
            Some(None) => {
                self.follow = None;
                Ok(self.flush())
            }
        }
    }

    /// a character cut short by the end of the output is replaced
    fn flush(&mut self) -> Option<StreamItem> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(StreamItem::Output(String::from_utf8_lossy(&rest).into_owned()))
    }

    /// Waits for text past the current position, `None` once the output is
    /// complete: the pid is gone and the file is drained after the exit was
    /// recorded, or after `settle` when it never is.
    async fn read_appended(&mut self) -> io::Result<Option<String>> {
        let follow = match &self.follow {
            Some(follow) => follow,
            None => return Ok(None),
        };
        loop {
            // check before reading, whatever was written up to now is read below
            let alive = is_pid_alive(follow.pid);
            let recorded = !alive && exit_recorded(&follow.metadata).await;
            if !alive && self.dead_since.is_none() {
                self.dead_since = Some(Instant::now());
            }
            let n = self.file.read(&mut self.buf).await?;
            if n > 0 {
                self.pending.extend_from_slice(&self.buf[..n]);
                let text = decode_utf8(&mut self.pending);
                if !text.is_empty() {
                    return Ok(Some(text));
                }
                continue;
            }
            if recorded {
                return Ok(None);
            }
            if let Some(since) = self.dead_since {
                if since.elapsed() >= follow.settle {
                    return Ok(None);
                }
            }
            sleep(self.poll).await;
        }
    }
}

async fn exit_recorded(metadata: &Path) -> bool {
    match fs::read(metadata).await {
        Ok(raw) => serde_json::from_slice::<Job>(&raw)
            .map(|job| job.is_finished())
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Decodes the complete characters at the front of `pending` and leaves an
/// incomplete trailing sequence in place. Invalid bytes become U+FFFD.
fn decode_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut at = 0;
    while at < pending.len() {
        match std::str::from_utf8(&pending[at..]) {
            Ok(valid) => {
                text.push_str(valid);
                at = pending.len();
            }
            Err(err) => {
                let valid_end = at + err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[at..valid_end]));
                match err.error_len() {
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        at = valid_end + invalid;
                    }
                    None => {
                        at = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..at);
    text
}

/// byte offset at which the last `lines` lines of the first `len` bytes start
async fn tail_offset(file: &mut File, len: u64, lines: usize) -> io::Result<u64> {
    if lines == 0 {
        return Ok(len);
    }
    let mut buf = vec![0u8; TAIL_BLOCK];
    let mut newlines = 0;
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_BLOCK as u64);
        let block = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(block).await?;
        for (i, byte) in block.iter().enumerate().rev() {
            let at = start + i as u64;
            // a trailing newline ends the last line, it does not start a new one
            if *byte != b'\n' || at + 1 == len {
                continue;
            }
            newlines += 1;
            if newlines == lines {
                return Ok(at + 1);
            }
        }
        end = start;
    }
    Ok(0)
}
