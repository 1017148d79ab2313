use std::{
    collections::{HashMap, VecDeque},
    convert::TryFrom,
    fs, io,
};

use tracing::{debug, info, warn};

use crate::util::proc_stat;

/// Live descendants of `pid`, parents before their children.
pub fn descendants(pid: u32) -> io::Result<Vec<u32>> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        let entry = entry?;
        let candidate = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
            Some(candidate) => candidate,
            None => continue,
        };
        // processes may vanish while we scan
        if let Ok((state, ppid)) = proc_stat(candidate) {
            if state != 'Z' {
                children.entry(ppid).or_default().push(candidate);
            }
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from(vec![pid]);
    while let Some(parent) = queue.pop_front() {
        for child in children.remove(&parent).unwrap_or_default() {
            found.push(child);
            queue.push_back(child);
        }
    }
    Ok(found)
}

fn signal(target: libc::pid_t, sig: libc::c_int) -> io::Result<()> {
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(target, sig) };
    if result == 0 {
        return Ok(());
    }
    match io::Error::last_os_error() {
        // already gone
        err if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        err => Err(err),
    }
}

/// SIGTERMs every descendant of `pid`, then `pid`, then its process group.
///
/// Does not wait for anything to exit. Only a failure to signal `pid` itself
/// is returned, the rest is logged.
pub fn kill_tree(pid: u32) -> io::Result<()> {
    let parent = match libc::pid_t::try_from(pid) {
        Ok(parent) if parent > 1 => parent,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {}", pid),
            ))
        }
    };
    let tree = match descendants(pid) {
        Ok(tree) => tree,
        Err(err) => {
            warn!("could not list descendants of pid {}: {}", pid, err);
            Vec::new()
        }
    };
    info!("terminating pid {} and {} descendants", pid, tree.len());
    let tree: Vec<libc::pid_t> = tree
        .into_iter()
        .filter_map(|child| libc::pid_t::try_from(child).ok())
        .collect();
    terminate_tree(parent, &tree, signal)
}

fn terminate_tree<F>(parent: libc::pid_t, tree: &[libc::pid_t], send: F) -> io::Result<()>
where
    F: Fn(libc::pid_t, libc::c_int) -> io::Result<()>,
{
    for child in tree {
        if let Err(err) = send(*child, libc::SIGTERM) {
            warn!("could not signal descendant {} of pid {}: {}", child, parent, err);
        }
    }
    let result = send(parent, libc::SIGTERM);
    // jobs run in their own group, this reaches anything that was reparented
    if let Err(err) = send(-parent, libc::SIGTERM) {
        debug!("could not signal process group {}: {}", parent, err);
    }
    result
}
