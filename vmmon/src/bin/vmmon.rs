//! Samples the resource usage of the virtualization management stack until told to stop.

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::clap_app;

use log::{error, info};

use vmmon::{
    daemon,
    discover::{self, SysinfoTable, Target},
    probe::SysinfoProbe,
    sampler::{self, SamplerConfig},
    MonError, StopToken,
};

/// Longest accepted interval, in seconds.
const MAX_INTERVAL: f64 = 86400.0;

fn is_float(s: String) -> Result<(), String> {
    s.parse::<f64>()
        .map_err(|e| format!("{:?}", e))
        .and_then(|v| {
            if v > 0.0 && v <= MAX_INTERVAL {
                Ok(())
            } else {
                Err(format!("must be positive and at most {}", MAX_INTERVAL))
            }
        })
}

fn is_usize(s: String) -> Result<(), String> {
    s.parse::<usize>().map(|_| ()).map_err(|e| format!("{:?}", e))
}

fn is_spec(s: String) -> Result<(), String> {
    s.parse::<discover::ProcessSpec>()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

struct Options {
    daemonize: bool,
    output: PathBuf,
    pid_file: Option<PathBuf>,
    targets: Vec<Target>,
    config: SamplerConfig,
}

fn options() -> Options {
    let matches = clap_app! { vmmon =>
        (about: "Periodically samples CPU, memory and thread usage of the hypervisor management \
                 processes and writes one JSON record per line. Stop it with SIGUSR1, SIGTERM or \
                 SIGINT.")
        (@arg DAEMON: -D --daemon "Detach and run in the background")
        (@arg OUTPUT: -o --output +takes_value
         "The file to write samples to (defaults to /dev/null)")
        (@arg PIDFILE: -p --pidfile +takes_value
         "Write the pid of the sampling process to this file")
        (@arg INTERVAL: -i --interval +takes_value {is_float}
         "Seconds between samples (defaults to 0.5)")
        (@arg FLUSH_EVERY: --flush_every +takes_value {is_usize}
         "Flush the output every N samples (defaults to 60)")
        (@arg PERCPU: --percpu "Also record per-core host CPU usage")
        (@arg TRACK: --track +takes_value ... {is_spec}
         "Processes to track instead of the default set. Each is `name`, `name@user`, \
          `label=/path/to/pidfile` or `~cmdline-substring`.")
        (@arg OPTIONAL: --optional +takes_value ... {is_spec}
         "Like --track, but it is not an error if the process is not running.")
    }
    .get_matches();

    let parse = |name: &str, required| -> Vec<Target> {
        matches
            .values_of(name)
            .map(|vals| {
                vals.filter_map(|v| v.parse().ok())
                    .map(|spec| Target { spec, required })
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut targets = parse("TRACK", true);
    targets.extend(parse("OPTIONAL", false));
    if targets.is_empty() {
        targets = discover::default_targets();
    }

    let defaults = SamplerConfig::default();
    let config = SamplerConfig {
        interval: matches
            .value_of("INTERVAL")
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.interval),
        flush_every: matches
            .value_of("FLUSH_EVERY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.flush_every),
        percpu: matches.is_present("PERCPU"),
    };

    Options {
        daemonize: matches.is_present("DAEMON"),
        output: matches.value_of("OUTPUT").unwrap_or("/dev/null").into(),
        pid_file: matches.value_of("PIDFILE").map(PathBuf::from),
        targets,
        config,
    }
}

fn run(opts: Options) -> Result<usize, MonError> {
    // Resolve before detaching, so that a missing process is reported to whoever started us.
    let tracked = discover::resolve(&SysinfoTable::snapshot(), &opts.targets)?;

    let output = daemon::absolutize(&opts.output)?;
    let pid_file = match opts.pid_file {
        Some(ref path) => Some(daemon::absolutize(path)?),
        None => None,
    };

    if opts.daemonize {
        daemon::daemonize()?;
    }

    let stop = StopToken::new();
    daemon::install_stop_handlers(&stop)?;

    if let Some(ref path) = pid_file {
        daemon::write_pid_file(path)?;
    }

    let mut out = BufWriter::new(open_output(&output)?);
    info!("writing samples to {}", output.display());

    let mut probe = SysinfoProbe::new();
    sampler::run(&mut probe, &tracked, &mut out, &opts.config, &stop)
}

/// Each run starts a fresh recording, even if an earlier one was never cleaned up.
fn open_output(path: &Path) -> Result<std::fs::File, MonError> {
    Ok(OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

fn main() {
    let opts = options();

    env_logger::init();

    match run(opts) {
        Ok(n) => info!("done after {} samples", n),
        Err(err) => {
            error!("{}", err);
            eprintln!("vmmon: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}
