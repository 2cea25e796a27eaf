//! Running the `vmmon` sampler on a remote host for the duration of an action.

use std::time::{Duration, Instant};

use log::{info, warn};

use spurs::{cmd, Execute, SshShell};

use crate::common::{Clock, Login};
use crate::error::BenchError;

/// Runs commands on the monitored host.
pub trait Remote {
    /// Run `cmd` with bash and return its standard output. A non-zero exit status is an error.
    fn execute(&self, cmd: &str) -> Result<String, failure::Error>;

    /// The contents of the file at `path`.
    fn fetch(&self, path: &str) -> Result<Vec<u8>, failure::Error>;
}

pub struct SshRemote {
    shell: SshShell,
}

impl SshRemote {
    pub fn connect(login: &Login) -> Result<Self, failure::Error> {
        let host = if login.hostname.contains(':') {
            login.hostname.to_owned()
        } else {
            format!("{}:22", login.hostname)
        };
        let shell = SshShell::with_default_key(login.username.as_str(), &host)?;
        Ok(SshRemote { shell })
    }
}

impl Remote for SshRemote {
    fn execute(&self, cmd: &str) -> Result<String, failure::Error> {
        Ok(self.shell.run(cmd!("{}", cmd).use_bash())?.stdout)
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, failure::Error> {
        Ok(self.execute(&format!("cat {}", path))?.into_bytes())
    }
}

/// Where and how the sampler runs on the remote host.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Directory for the sample and pid files. May refer to shell variables.
    pub workdir: String,

    /// Appended to `PATH` to find `vmmon`.
    pub extra_path: Option<String>,

    /// Sampling interval in seconds, if not the sampler's default.
    pub interval: Option<f64>,

    /// How long to wait for the sampler to write its pid file.
    pub launch_timeout: Duration,

    /// How long to wait for the sampler to exit after being signalled.
    pub exit_timeout: Duration,

    pub poll: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            workdir: "$HOME".into(),
            extra_path: None,
            interval: None,
            launch_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(30),
            poll: Duration::from_millis(500),
        }
    }
}

impl MonitorConfig {
    pub fn samples_path(&self) -> String {
        dir!(self.workdir.as_str(), "samples.json")
    }

    pub fn pid_path(&self) -> String {
        dir!(self.workdir.as_str(), "mon.pid")
    }

    fn launch_cmd(&self) -> String {
        let mut cmd = format!(
            "mkdir -p {} && rm -f {} {} && ",
            self.workdir,
            self.samples_path(),
            self.pid_path()
        );
        if let Some(ref path) = self.extra_path {
            cmd.push_str(&format!("PATH=$PATH:{} ", path));
        }
        cmd.push_str(&format!(
            "vmmon -D -o {} -p {}",
            self.samples_path(),
            self.pid_path()
        ));
        if let Some(interval) = self.interval {
            cmd.push_str(&format!(" -i {}", interval));
        }
        cmd
    }
}

fn wait_for_pid(remote: &dyn Remote, config: &MonitorConfig) -> Result<u32, BenchError> {
    let begin = Instant::now();
    loop {
        let out = remote
            .execute(&format!("cat {} 2>/dev/null || true", config.pid_path()))
            .map_err(|e| BenchError::remote("launch", e))?;
        if let Ok(pid) = out.trim().parse::<u32>() {
            return Ok(pid);
        }

        if begin.elapsed() >= config.launch_timeout {
            return Err(BenchError::remote(
                "launch",
                format!("no pid file at {}", config.pid_path()),
            ));
        }
        std::thread::sleep(config.poll);
    }
}

/// Best-effort stop and cleanup of a sampler whose pid is unknown.
fn abandon(remote: &dyn Remote, config: &MonitorConfig) {
    let cmds = [
        format!(
            "pkill -USR1 -f 'vmmon -D -o {}' 2>/dev/null || true",
            config.samples_path()
        ),
        format!("rm -f {} {}", config.samples_path(), config.pid_path()),
    ];
    for cmd in cmds.iter() {
        if let Err(err) = remote.execute(cmd) {
            warn!("unable to clean up after failed launch: {}", err);
        }
    }
}

/// A sampler running on a remote host. It is always stopped and its files removed, either by
/// `finish` or, if the session is dropped without finishing, on drop.
pub struct MonitorSession<'r> {
    remote: &'r dyn Remote,
    config: MonitorConfig,
    pid: u32,
    released: bool,
}

impl<'r> MonitorSession<'r> {
    /// Start the sampler and wait until it has written its pid file. If the pid file never
    /// shows up, any sampler started here is signalled by its command line and its files are
    /// removed before returning the error.
    pub fn launch(remote: &'r dyn Remote, config: MonitorConfig) -> Result<Self, BenchError> {
        remote
            .execute(&config.launch_cmd())
            .map_err(|e| BenchError::remote("launch", e))?;

        let pid = match wait_for_pid(remote, &config) {
            Ok(pid) => pid,
            Err(err) => {
                abandon(remote, &config);
                return Err(err);
            }
        };

        Ok(MonitorSession {
            remote,
            config,
            pid,
            released: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Signal the sampler and wait for it to exit. Signalling a sampler that is already gone is
    /// not an error.
    fn stop(&self) -> Result<(), BenchError> {
        self.remote
            .execute(&format!("kill -USR1 {} 2>/dev/null || true", self.pid))
            .map_err(|e| BenchError::remote("stop", e))?;

        let begin = Instant::now();
        loop {
            let out = self
                .remote
                .execute(&format!(
                    "kill -0 {} 2>/dev/null && echo running || echo gone",
                    self.pid
                ))
                .map_err(|e| BenchError::remote("stop", e))?;
            if out.trim() == "gone" {
                return Ok(());
            }

            if begin.elapsed() >= self.config.exit_timeout {
                return Err(BenchError::remote(
                    "stop",
                    format!("sampler {} still running", self.pid),
                ));
            }
            std::thread::sleep(self.config.poll);
        }
    }

    fn cleanup(&self) {
        let cmd = format!(
            "rm -f {} {}",
            self.config.samples_path(),
            self.config.pid_path()
        );
        if let Err(err) = self.remote.execute(&cmd) {
            warn!("unable to remove sampler files: {}", err);
        }
    }

    /// Stop the sampler, collect its samples and remove its files. Every step is attempted even
    /// if an earlier one fails.
    pub fn finish(mut self) -> Result<Vec<u8>, BenchError> {
        self.released = true;

        let stopped = self.stop();
        let data = self
            .remote
            .fetch(&self.config.samples_path())
            .map_err(|e| BenchError::remote("fetch", e));
        self.cleanup();

        stopped?;
        data
    }
}

impl Drop for MonitorSession<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!("sampler {} was not finished, stopping it", self.pid);
        if let Err(err) = self.stop() {
            warn!("{}", err);
        }
        self.cleanup();
    }
}

/// Sample the remote host while `action` runs locally. Returns the action's result and the
/// collected samples. If the action fails, its error is returned and the sampler is still
/// stopped and cleaned up.
pub fn monitor<T, F>(
    remote: &dyn Remote,
    config: &MonitorConfig,
    action: F,
) -> Result<(T, Vec<u8>), failure::Error>
where
    F: FnOnce() -> Result<T, failure::Error>,
{
    let session = MonitorSession::launch(remote, config.clone())?;
    info!("sampler running with pid {}", session.pid());

    let value = action()?;

    let data = session.finish()?;

    Ok((value, data))
}

/// Sleep for `duration` in chunks of at most `chunk`, logging progress.
pub fn idle(clock: &dyn Clock, duration: Duration, chunk: Duration) {
    let total = duration.as_secs_f64();
    let begin = clock.now();

    loop {
        let elapsed = clock.now() - begin;
        if elapsed >= total {
            break;
        }

        info!(
            "idling for {:.0} more seconds, {:.0} elapsed",
            total - elapsed,
            elapsed
        );
        clock.sleep(chunk.min(Duration::from_secs_f64(total - elapsed)));
    }
}
