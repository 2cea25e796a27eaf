//! Resolve the set of processes to track. This happens exactly once, before sampling starts.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{info, warn};

use sysinfo::{Pid, System, Users};

use crate::{MonError, Tracked};

/// How to find a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessSpec {
    /// Read the pid from a pid file, recording samples under `label`. Written as `label=/path`.
    PidFile { label: String, path: PathBuf },

    /// Look up processes by executable name, optionally owned by the given user. Written as
    /// `name` or `name@user`.
    Name { name: String, user: Option<String> },

    /// Look up processes whose command line contains `pattern`. Written as `~pattern`.
    Cmdline { pattern: String },
}

impl FromStr for ProcessSpec {
    type Err = MonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| MonError::BadSpec {
            spec: s.into(),
            reason: reason.into(),
        };

        if let Some(pattern) = s.strip_prefix('~') {
            if pattern.is_empty() {
                return Err(bad("empty command line pattern"));
            }
            return Ok(ProcessSpec::Cmdline {
                pattern: pattern.into(),
            });
        }

        if let Some((label, path)) = s.split_once('=') {
            if label.is_empty() || path.is_empty() {
                return Err(bad("expected `label=/path/to/pidfile`"));
            }
            return Ok(ProcessSpec::PidFile {
                label: label.into(),
                path: path.into(),
            });
        }

        match s.split_once('@') {
            Some((name, user)) if !name.is_empty() && !user.is_empty() => Ok(ProcessSpec::Name {
                name: name.into(),
                user: Some(user.into()),
            }),
            Some(_) => Err(bad("expected `name@user`")),
            None if s.is_empty() => Err(bad("empty process name")),
            None => Ok(ProcessSpec::Name {
                name: s.into(),
                user: None,
            }),
        }
    }
}

impl std::fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProcessSpec::PidFile { label, path } => write!(f, "{}={}", label, path.display()),
            ProcessSpec::Name {
                name,
                user: Some(user),
            } => write!(f, "{}@{}", name, user),
            ProcessSpec::Name { name, user: None } => write!(f, "{}", name),
            ProcessSpec::Cmdline { pattern } => write!(f, "~{}", pattern),
        }
    }
}

/// A process spec plus whether failing to resolve it is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub spec: ProcessSpec,
    pub required: bool,
}

/// The management stack of an oVirt host: libvirt and VDSM are required, the VM monitor and MOM
/// are tracked if they happen to be running.
pub fn default_targets() -> Vec<Target> {
    let spec = |s: &str, required| Target {
        spec: s.parse().expect("default specs are valid"),
        required,
    };

    vec![
        spec("libvirtd", true),
        spec("vdsm@vdsm", true),
        spec("vmon", false),
        spec("~momd", false),
    ]
}

/// Read-only view of the process table used during discovery.
pub trait ProcessTable {
    /// Pids of processes with the given executable name (and owner, if given).
    fn find_by_name(&self, name: &str, user: Option<&str>) -> Vec<u32>;

    /// Pids of processes whose command line contains `pattern`.
    fn find_by_cmdline(&self, pattern: &str) -> Vec<u32>;

    /// The parent of `pid`, if `pid` exists and has one.
    fn parent(&self, pid: u32) -> Option<u32>;

    /// Whether `pid` is currently running.
    fn exists(&self, pid: u32) -> bool;
}

/// The live process table, as seen by `sysinfo`.
pub struct SysinfoTable {
    sys: System,
    users: Users,
}

impl SysinfoTable {
    pub fn snapshot() -> Self {
        let mut sys = System::new();
        sys.refresh_processes();
        SysinfoTable {
            sys,
            users: Users::new_with_refreshed_list(),
        }
    }

    fn owner_name(&self, process: &sysinfo::Process) -> Option<&str> {
        process
            .user_id()
            .and_then(|uid| self.users.get_user_by_id(uid))
            .map(|user| user.name())
    }
}

impl ProcessTable for SysinfoTable {
    fn find_by_name(&self, name: &str, user: Option<&str>) -> Vec<u32> {
        self.sys
            .processes_by_exact_name(name)
            .filter(|p| user.map_or(true, |user| self.owner_name(p) == Some(user)))
            .map(|p| p.pid().as_u32())
            .collect()
    }

    fn find_by_cmdline(&self, pattern: &str) -> Vec<u32> {
        let me = std::process::id();
        self.sys
            .processes()
            .values()
            .filter(|p| p.pid().as_u32() != me)
            .filter(|p| p.cmd().iter().any(|arg| arg.contains(pattern)))
            .map(|p| p.pid().as_u32())
            .collect()
    }

    fn parent(&self, pid: u32) -> Option<u32> {
        self.sys
            .process(Pid::from_u32(pid))
            .and_then(|p| p.parent())
            .map(|p| p.as_u32())
    }

    fn exists(&self, pid: u32) -> bool {
        self.sys.process(Pid::from_u32(pid)).is_some()
    }
}

/// Resolve all targets against the process table. Any required target that cannot be resolved
/// is an error; optional ones are skipped.
pub fn resolve(table: &dyn ProcessTable, targets: &[Target]) -> Result<Vec<Tracked>, MonError> {
    let mut tracked: Vec<Tracked> = Vec::new();

    for target in targets {
        let found = match resolve_one(table, &target.spec) {
            Ok(found) => found,
            Err(err) if !target.required => {
                warn!("Not tracking optional process: {}", err);
                continue;
            }
            Err(err) => return Err(err),
        };

        for t in found {
            if tracked.iter().any(|other| other.pid == t.pid) {
                warn!("pid {} already tracked, ignoring {}", t.pid, t.label);
                continue;
            }
            tracked.push(t);
        }
    }

    for t in &tracked {
        info!(
            "tracking: {} pid={} ppid={}",
            t.label,
            t.pid,
            table.parent(t.pid).unwrap_or(0)
        );
    }

    Ok(tracked)
}

fn resolve_one(table: &dyn ProcessTable, spec: &ProcessSpec) -> Result<Vec<Tracked>, MonError> {
    let not_found = |reason: String| MonError::ProcessNotFound {
        spec: spec.to_string(),
        reason,
    };

    match spec {
        ProcessSpec::PidFile { label, path } => {
            let pid = read_pid_file(path).map_err(not_found)?;
            if !table.exists(pid) {
                return Err(not_found(format!("pid {} is not running", pid)));
            }
            Ok(vec![Tracked {
                label: label.clone(),
                pid,
            }])
        }

        ProcessSpec::Name { name, user } => {
            let mut pids = table.find_by_name(name, user.as_ref().map(String::as_str));
            pids.sort();
            split_roles(table, name, &pids).ok_or_else(|| not_found("no such process".into()))
        }

        ProcessSpec::Cmdline { pattern } => {
            let mut pids = table.find_by_cmdline(pattern);
            pids.sort();
            pids.first()
                .map(|&pid| {
                    vec![Tracked {
                        label: pattern.clone(),
                        pid,
                    }]
                })
                .ok_or_else(|| not_found("no matching command line".into()))
        }
    }
}

/// A service like VDSM may run a helper process under the same name. The main process is the one
/// started by init, or failing that, the one whose parent is not itself a match. Another match is
/// tracked as its sampler only if it is a child of the main process. Pids may wrap around, so
/// their order says nothing. Role suffixes are only used when more than one process matched.
fn split_roles(table: &dyn ProcessTable, name: &str, pids: &[u32]) -> Option<Vec<Tracked>> {
    let (&first, rest) = pids.split_first()?;

    if rest.is_empty() {
        return Some(vec![Tracked {
            label: name.into(),
            pid: first,
        }]);
    }

    let main = pids
        .iter()
        .copied()
        .find(|&pid| table.parent(pid) == Some(1))
        .or_else(|| {
            pids.iter().copied().find(|&pid| {
                table
                    .parent(pid)
                    .map_or(true, |ppid| !pids.contains(&ppid))
            })
        })
        .unwrap_or(first);

    let mut tracked = vec![Tracked {
        label: format!("{}_main", name),
        pid: main,
    }];

    let aux = pids
        .iter()
        .copied()
        .find(|&pid| pid != main && table.parent(pid) == Some(main));
    if let Some(aux) = aux {
        tracked.push(Tracked {
            label: format!("{}_sampler", name),
            pid: aux,
        });
    }

    Some(tracked)
}

pub fn read_pid_file(path: &Path) -> Result<u32, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("unable to read {}: {}", path.display(), e))?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("bad pid file {}: {}", path.display(), e))
}

/// A process table backed by plain maps.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticTable {
    /// pid -> (name, user, cmdline, parent)
    pub procs: std::collections::HashMap<u32, (String, String, String, u32)>,
}

#[cfg(test)]
impl StaticTable {
    pub fn with(mut self, pid: u32, name: &str, user: &str, cmdline: &str, ppid: u32) -> Self {
        self.procs
            .insert(pid, (name.into(), user.into(), cmdline.into(), ppid));
        self
    }
}

#[cfg(test)]
impl ProcessTable for StaticTable {
    fn find_by_name(&self, name: &str, user: Option<&str>) -> Vec<u32> {
        self.procs
            .iter()
            .filter(|(_, (n, u, _, _))| n == name && user.map_or(true, |user| u == user))
            .map(|(&pid, _)| pid)
            .collect()
    }

    fn find_by_cmdline(&self, pattern: &str) -> Vec<u32> {
        self.procs
            .iter()
            .filter(|(_, (_, _, cmd, _))| cmd.contains(pattern))
            .map(|(&pid, _)| pid)
            .collect()
    }

    fn parent(&self, pid: u32) -> Option<u32> {
        self.procs.get(&pid).map(|p| p.3)
    }

    fn exists(&self, pid: u32) -> bool {
        self.procs.contains_key(&pid)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn ovirt_host() -> StaticTable {
        StaticTable::default()
            .with(1, "systemd", "root", "/usr/lib/systemd/systemd", 0)
            .with(800, "libvirtd", "root", "/usr/sbin/libvirtd --listen", 1)
            .with(900, "vdsm", "vdsm", "/usr/bin/python /usr/share/vdsm/vdsm", 1)
            .with(950, "vdsm", "vdsm", "/usr/bin/python /usr/share/vdsm/vdsm", 900)
            .with(990, "python", "vdsm", "/usr/bin/python /usr/share/vdsm/momd", 1)
    }

    #[test]
    fn spec_syntax() {
        assert_eq!(
            "libvirtd".parse::<ProcessSpec>().unwrap(),
            ProcessSpec::Name {
                name: "libvirtd".into(),
                user: None
            }
        );
        assert_eq!(
            "vdsm@vdsm".parse::<ProcessSpec>().unwrap(),
            ProcessSpec::Name {
                name: "vdsm".into(),
                user: Some("vdsm".into())
            }
        );
        assert_eq!(
            "libvirtd=/var/run/libvirtd.pid".parse::<ProcessSpec>().unwrap(),
            ProcessSpec::PidFile {
                label: "libvirtd".into(),
                path: "/var/run/libvirtd.pid".into()
            }
        );
        assert_eq!(
            "~momd".parse::<ProcessSpec>().unwrap(),
            ProcessSpec::Cmdline {
                pattern: "momd".into()
            }
        );
        assert!("vdsm@".parse::<ProcessSpec>().is_err());
        assert!("=/var/run/x.pid".parse::<ProcessSpec>().is_err());
        assert!("~".parse::<ProcessSpec>().is_err());

        for s in &["libvirtd", "vdsm@vdsm", "x=/run/x.pid", "~momd"] {
            assert_eq!(s.parse::<ProcessSpec>().unwrap().to_string(), *s);
        }
    }

    #[test]
    fn default_stack() {
        let tracked = resolve(&ovirt_host(), &default_targets()).unwrap();
        let labels: Vec<_> = tracked.iter().map(|t| (t.label.as_str(), t.pid)).collect();
        assert_eq!(
            labels,
            vec![
                ("libvirtd", 800),
                ("vdsm_main", 900),
                ("vdsm_sampler", 950),
                ("momd", 990)
            ]
        );
    }

    #[test]
    fn unrelated_second_instance_is_not_a_sampler() {
        let table = StaticTable::default()
            .with(900, "vdsm", "vdsm", "vdsm", 1)
            .with(950, "vdsm", "vdsm", "vdsm", 1);
        let targets = vec![Target {
            spec: "vdsm".parse().unwrap(),
            required: true,
        }];
        let tracked = resolve(&table, &targets).unwrap();
        assert_eq!(
            tracked,
            vec![Tracked {
                label: "vdsm_main".into(),
                pid: 900
            }]
        );
    }

    #[test]
    fn wrapped_pids() {
        // The helper was forked after the pid counter wrapped around.
        let table = StaticTable::default()
            .with(900, "vdsm", "vdsm", "vdsm", 1)
            .with(300, "vdsm", "vdsm", "vdsm", 900);
        let targets = vec![Target {
            spec: "vdsm".parse().unwrap(),
            required: true,
        }];
        let tracked = resolve(&table, &targets).unwrap();
        assert_eq!(
            tracked,
            vec![
                Tracked {
                    label: "vdsm_main".into(),
                    pid: 900
                },
                Tracked {
                    label: "vdsm_sampler".into(),
                    pid: 300
                }
            ]
        );
    }

    #[test]
    fn user_filter() {
        let table = ovirt_host();
        let targets = vec![Target {
            spec: "vdsm@root".parse().unwrap(),
            required: true,
        }];
        match resolve(&table, &targets) {
            Err(MonError::ProcessNotFound { spec, .. }) => assert_eq!(spec, "vdsm@root"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_required_is_fatal() {
        let table = StaticTable::default().with(800, "libvirtd", "root", "libvirtd", 1);
        let err = resolve(&table, &default_targets()).unwrap_err();
        assert_eq!(err.exit_code(), crate::EXIT_PROCESS_NOT_FOUND);
    }

    #[test]
    fn missing_optional_is_skipped() {
        let table = StaticTable::default()
            .with(800, "libvirtd", "root", "libvirtd", 1)
            .with(900, "vdsm", "vdsm", "vdsm", 1);
        let tracked = resolve(&table, &default_targets()).unwrap();
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[1].label, "vdsm");
    }

    #[test]
    fn pid_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "800").unwrap();

        let table = ovirt_host();
        let targets = vec![Target {
            spec: ProcessSpec::PidFile {
                label: "libvirtd".into(),
                path: file.path().into(),
            },
            required: true,
        }];
        let tracked = resolve(&table, &targets).unwrap();
        assert_eq!(tracked[0].pid, 800);

        // A stale pid file is as good as no pid file.
        let mut stale = tempfile::NamedTempFile::new().unwrap();
        writeln!(stale, "4242").unwrap();
        let targets = vec![Target {
            spec: ProcessSpec::PidFile {
                label: "libvirtd".into(),
                path: stale.path().into(),
            },
            required: true,
        }];
        assert!(resolve(&table, &targets).is_err());

        let targets = vec![Target {
            spec: ProcessSpec::PidFile {
                label: "libvirtd".into(),
                path: "/nonexistent/libvirtd.pid".into(),
            },
            required: true,
        }];
        assert!(resolve(&table, &targets).is_err());
    }

    #[test]
    fn duplicate_pids_tracked_once() {
        let table = ovirt_host();
        let targets = vec![
            Target {
                spec: "libvirtd".parse().unwrap(),
                required: true,
            },
            Target {
                spec: "~libvirtd".parse().unwrap(),
                required: true,
            },
        ];
        let tracked = resolve(&table, &targets).unwrap();
        assert_eq!(tracked.len(), 1);
    }
}
