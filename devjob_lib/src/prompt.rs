use tokio::{
    io::AsyncWriteExt,
    process::ChildStdin,
    sync::mpsc::Receiver,
};
use tracing::{debug, info, warn};

const HOST_KEY_PROMPTS: &[&str] = &["(yes/no)? ", "(yes/no/[fingerprint])? "];
const PASSWORD_PROMPT: &str = "password: ";
// longest tail worth keeping for matching
const LINE_TAIL_CAP: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prompt {
    HostKey,
    Password,
}

/// Tail of the line currently being emitted by the job.
#[derive(Debug, Default)]
pub struct LineTail {
    tail: Vec<u8>,
}

impl LineTail {
    /// feeds a chunk and reports a prompt if the unfinished line ends in one
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Prompt> {
        match chunk.iter().rposition(|b| *b == b'\n') {
            Some(newline) => {
                self.tail.clear();
                self.tail.extend_from_slice(&chunk[newline + 1..]);
            }
            None => self.tail.extend_from_slice(chunk),
        }
        if self.tail.len() > LINE_TAIL_CAP {
            let excess = self.tail.len() - LINE_TAIL_CAP;
            self.tail.drain(..excess);
        }
        let prompt = match_prompt(&self.tail);
        if prompt.is_some() {
            // answered once, a repeated prompt is a new line anyway
            self.tail.clear();
        }
        prompt
    }
}

fn match_prompt(tail: &[u8]) -> Option<Prompt> {
    let line = String::from_utf8_lossy(tail);
    if HOST_KEY_PROMPTS.iter().any(|p| line.ends_with(p)) {
        Some(Prompt::HostKey)
    } else if line.to_ascii_lowercase().ends_with(PASSWORD_PROMPT) {
        Some(Prompt::Password)
    } else {
        None
    }
}

/// Answers prompts seen in the child's combined output on its stdin.
///
/// Runs until the output reader drops its sender. Unmatched output is
/// simply ignored, so a prompt nobody recognises leaves the child waiting on
/// its own timeout.
pub async fn respond_to_prompts(
    job_id: String,
    mut stdin: ChildStdin,
    password: Option<String>,
    mut chunks: Receiver<Vec<u8>>,
) {
    let mut tail = LineTail::default();
    while let Some(chunk) = chunks.recv().await {
        let answer = match tail.feed(&chunk) {
            Some(Prompt::HostKey) => "yes\n".to_string(),
            Some(Prompt::Password) => match &password {
                Some(password) => format!("{}\n", password),
                None => {
                    debug!("job {} asked for a password but none was supplied", job_id);
                    continue;
                }
            },
            None => continue,
        };
        info!("job {} is prompting, answering", job_id);
        let written = async {
            stdin.write_all(answer.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(err) = written.await {
            warn!("could not answer prompt of job {}: {}", job_id, err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{LineTail, Prompt};

    #[test]
    fn test_host_key_prompt() {
        let mut tail = LineTail::default();
        let prompt = b"The authenticity of host 'gh (1.2.3.4)' can't be established.\n\
                       Are you sure you want to continue connecting (yes/no)? ";
        assert_eq!(Some(Prompt::HostKey), tail.feed(prompt));
        let prompt = b"Are you sure you want to continue connecting (yes/no/[fingerprint])? ";
        assert_eq!(Some(Prompt::HostKey), tail.feed(prompt));
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut tail = LineTail::default();
        assert_eq!(None, tail.feed(b"cloning...\ngit@host's pass"));
        assert_eq!(Some(Prompt::Password), tail.feed(b"word: "));
        // answered prompts are forgotten
        assert_eq!(None, tail.feed(b""));
        assert_eq!(Some(Prompt::Password), tail.feed(b"\nPassword: "));
    }

    #[test]
    fn test_no_prompt() {
        let mut tail = LineTail::default();
        assert_eq!(None, tail.feed(b"password: is printed on a finished line\n"));
        assert_eq!(None, tail.feed(b"progress 10%"));
        assert_eq!(None, tail.feed(&[b'x'; 4096]));
    }
}
