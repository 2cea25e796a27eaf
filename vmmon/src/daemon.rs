//! Turning the sampler into a well-behaved background process: detaching from the terminal,
//! recording the pid and reacting to stop signals.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::{MonError, StopToken};

/// The flag the signal handler sets. Installed once and intentionally never freed, since the
/// handler may run at any point until the process exits.
static STOP_FLAG: AtomicPtr<AtomicBool> = AtomicPtr::new(std::ptr::null_mut());

/// The signals that ask the daemon to finish up and exit cleanly.
pub const STOP_SIGNALS: [libc::c_int; 3] = [libc::SIGUSR1, libc::SIGTERM, libc::SIGINT];

extern "C" fn on_stop_signal(_: libc::c_int) {
    // Only async-signal-safe work here: a single atomic store.
    let flag = STOP_FLAG.load(Ordering::SeqCst);
    if !flag.is_null() {
        unsafe { (*flag).store(true, Ordering::SeqCst) };
    }
}

/// Make SIGUSR1, SIGTERM and SIGINT trip `token`. The sampling loop notices at its next tick.
pub fn install_stop_handlers(token: &StopToken) -> Result<(), MonError> {
    let flag = Arc::into_raw(Arc::clone(token.flag())) as *mut AtomicBool;
    // The old token is leaked: a handler may still be using it.
    if !STOP_FLAG.swap(flag, Ordering::SeqCst).is_null() {
        debug!("replacing previously installed stop token");
    }

    for &sig in STOP_SIGNALS.iter() {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);

            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
    }

    Ok(())
}

/// Detach from the controlling terminal. The parent exits immediately with status 0; only the
/// child returns from this function. Standard streams are pointed at `/dev/null`, so all
/// relative paths must have been resolved before calling this.
pub fn daemonize() -> Result<(), MonError> {
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error().into()),
        0 => {}
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in &[libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull.as_raw_fd(), *fd) } == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    Ok(())
}

/// Record the current pid in `path` so that a coordinator can signal us later.
pub fn write_pid_file(path: &Path) -> Result<(), MonError> {
    let pid = std::process::id();
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    file.sync_all()?;

    info!("pid {} written to {}", pid, path.display());

    Ok(())
}

/// Make `path` absolute with respect to the current directory, which is about to be lost.
pub fn absolutize(path: &Path) -> Result<std::path::PathBuf, MonError> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmmon.pid");

        write_pid_file(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        assert_eq!(
            crate::discover::read_pid_file(&path).unwrap(),
            std::process::id()
        );
    }

    #[test]
    fn relative_paths() {
        let abs = absolutize(Path::new("/tmp/out.json")).unwrap();
        assert_eq!(abs, Path::new("/tmp/out.json"));

        let rel = absolutize(Path::new("out.json")).unwrap();
        assert!(rel.is_absolute());
        assert!(rel.ends_with("out.json"));
    }

    #[test]
    fn usr1_trips_the_token() {
        let token = StopToken::new();
        install_stop_handlers(&token).unwrap();
        assert!(!token.is_stopped());

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        assert!(token.is_stopped());
    }
}
