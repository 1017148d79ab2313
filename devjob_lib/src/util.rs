use std::{
    convert::TryFrom,
    io,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    time::Duration,
};

use tokio::time::sleep;
use uuid::Uuid;

/// exit code recorded when the real one could not be observed
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// time ordered unique job id
pub fn new_job_id() -> String {
    Uuid::now_v7().to_string()
}

/// shell convention: processes killed by a signal report 128 + signal
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// `(state, ppid)` from `/proc/<pid>/stat`
pub fn proc_stat(pid: u32) -> io::Result<(char, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_stat(&stat)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc stat line"))
}

fn parse_stat(stat: &str) -> Option<(char, u32)> {
    // comm is parenthesised and may itself contain spaces or parens
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// true while `pid` names a process that has not exited, zombies count as gone
pub fn is_pid_alive(pid: u32) -> bool {
    let pid_t = match libc::pid_t::try_from(pid) {
        Ok(pid_t) if pid_t > 0 => pid_t,
        _ => return false,
    };
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(pid_t, 0) };
    if result != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    match proc_stat(pid) {
        Ok((state, _)) => state != 'Z' && state != 'X',
        // no procfs on this host, trust kill
        Err(_) => true,
    }
}

pub async fn wait_until_gone(pid: u32, poll: Duration) {
    while is_pid_alive(pid) {
        sleep(poll).await;
    }
}
