//! Measure the boot latency of a group of VMs over several trials.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{clap_app, Arg};

use crate::{
    common::{BenchConfig, BenchCtx, NameScheme, SystemClock},
    orchestrate::mass_start,
    ovirt::{self, OvirtApi},
    trials::{dump, run_trials, summarize},
};

pub fn is_usize(s: String) -> Result<(), String> {
    s.as_str()
        .parse::<usize>()
        .map(|_| ())
        .map_err(|e| format!("{:?}", e))
}

/// Larger values would overflow a `Duration`.
const MAX_SECS: f64 = 1e9;

pub fn is_secs(s: String) -> Result<(), String> {
    match s.as_str().parse::<f64>() {
        Ok(v) if v > 0.0 && v <= MAX_SECS => Ok(()),
        Ok(_) => Err(format!("must be positive and at most {}", MAX_SECS)),
        Err(e) => Err(format!("{:?}", e)),
    }
}

pub fn cli_options() -> clap::App<'static, 'static> {
    let app = clap_app! { bench =>
        (about: "Start a group of VMs, measure how long each takes to come up and stop them \
                 again. Repeat for a number of trials and report rank statistics.")
        (@arg RUNS: -r --runs +takes_value {is_usize}
         "The number of trials (defaults to 3)")
        (@arg STORE: -S --store_result
         "Write the raw results and a `.params` file to the current directory instead of \
          printing the raw results")
    };

    ovirt::engine_args(vm_args(app))
}

/// Add the options that select and pace the VMs of a run.
pub fn vm_args(app: clap::App<'static, 'static>) -> clap::App<'static, 'static> {
    app.arg(
        Arg::with_name("VM_NAME")
            .short("N")
            .long("vm_name")
            .takes_value(true)
            .help("The base name of the VMs (defaults to `Tiny`)"),
    )
    .arg(
        Arg::with_name("NUM_VMS")
            .short("n")
            .long("num_vms")
            .takes_value(true)
            .validator(is_usize)
            .help("The number of VMs (defaults to 32)"),
    )
    .arg(
        Arg::with_name("FIRST")
            .long("first")
            .takes_value(true)
            .validator(is_usize)
            .help("The index of the first VM (defaults to 0)"),
    )
    .arg(
        Arg::with_name("PADDED")
            .long("padded")
            .help("VMs are named `<name>_C<index>` with a 3-digit index"),
    )
    .arg(
        Arg::with_name("SERIALLY")
            .short("s")
            .long("serially")
            .conflicts_with("WORKERS")
            .help("Start VMs one after the other"),
    )
    .arg(
        Arg::with_name("WORKERS")
            .long("workers")
            .takes_value(true)
            .validator(is_usize)
            .help("The number of threads issuing start requests (defaults to one per VM)"),
    )
    .arg(
        Arg::with_name("POLL_INTERVAL")
            .long("poll_interval")
            .takes_value(true)
            .validator(is_secs)
            .help("Seconds between two status sweeps (defaults to 1)"),
    )
    .arg(
        Arg::with_name("DEADLINE")
            .long("deadline")
            .takes_value(true)
            .validator(is_secs)
            .help("Seconds to wait for the VMs to come up before failing (defaults to 300)"),
    )
}

/// The VM selection given on the command line. All values were validated by clap.
pub fn config_from(sub_m: &clap::ArgMatches<'_>) -> BenchConfig {
    let defaults = BenchConfig::default();
    let usize_of = |name| sub_m.value_of(name).and_then(|v| v.parse::<usize>().ok());
    let secs_of = |name| {
        sub_m
            .value_of(name)
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
    };

    let num_vms = usize_of("NUM_VMS").unwrap_or(defaults.num_vms);
    let workers = if sub_m.is_present("SERIALLY") {
        None
    } else {
        Some(usize_of("WORKERS").unwrap_or(num_vms))
    };

    BenchConfig {
        vm_name: sub_m
            .value_of("VM_NAME")
            .map(String::from)
            .unwrap_or(defaults.vm_name),
        scheme: if sub_m.is_present("PADDED") {
            NameScheme::Padded
        } else {
            NameScheme::Plain
        },
        first: usize_of("FIRST").unwrap_or(defaults.first),
        num_vms,
        workers,
        poll_interval: secs_of("POLL_INTERVAL").unwrap_or(defaults.poll_interval),
        deadline: secs_of("DEADLINE").unwrap_or(defaults.deadline),
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let runs = sub_m
        .value_of("RUNS")
        .map(|v| v.parse::<usize>())
        .transpose()?
        .unwrap_or(3);
    let store = sub_m.is_present("STORE");

    let config = config_from(sub_m);
    let engine = ovirt::config_from(sub_m)?;

    let settings = settings! {
        * vm_name: config.vm_name,
        * num_vms: config.num_vms,
        first: config.first,
        scheme: config.scheme,
        workers: config.workers,
        poll_interval: config.poll_interval.as_secs_f64(),
        deadline: config.deadline.as_secs_f64(),
        runs: runs,
        engine: engine.url,
        engine_user: engine.user,
    };

    let api = Arc::new(OvirtApi::new(engine)?);
    let ctx = BenchCtx::new(config, api, Arc::new(SystemClock::new()));

    let aggregate = run_trials(runs, |i| Ok(mass_start(&ctx, i)?))?;

    let mut raw = Vec::new();
    dump(&aggregate, &mut raw)?;
    let summary = summarize(&aggregate);

    if store {
        let path = settings.write_results(Path::new("."), &raw)?;
        print!("{}", summary.render(&path.display().to_string()));
        println!("RESULTS: {}", path.display());
    } else {
        std::io::stdout().write_all(&raw)?;
        eprint!("{}", summary.render("stdout"));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn matches(args: &[&str]) -> clap::ArgMatches<'static> {
        let mut argv = vec!["bench"];
        argv.extend_from_slice(args);
        cli_options().get_matches_from(argv)
    }

    #[test]
    fn defaults() {
        let config = config_from(&matches(&[]));
        assert_eq!(config.vm_name, "Tiny");
        assert_eq!(config.num_vms, 32);
        assert_eq!(config.workers, Some(32));
        assert_eq!(config.scheme, NameScheme::Plain);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.deadline, Duration::from_secs(300));
    }

    #[test]
    fn options() {
        let config = config_from(&matches(&[
            "-N",
            "SuperTiny",
            "-n",
            "4",
            "--first",
            "10",
            "--padded",
            "-s",
            "--poll_interval",
            "0.5",
        ]));
        assert_eq!(
            config.names(),
            vec![
                "SuperTiny_C010",
                "SuperTiny_C011",
                "SuperTiny_C012",
                "SuperTiny_C013"
            ]
        );
        assert_eq!(config.workers, None);
        assert_eq!(config.poll_interval, Duration::from_millis(500));

        let config = config_from(&matches(&["-n", "8", "--workers", "2"]));
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn validation() {
        let bad = |args: &[&str]| {
            let mut argv = vec!["bench"];
            argv.extend_from_slice(args);
            cli_options().get_matches_from_safe(argv).is_err()
        };
        assert!(bad(&["-n", "many"]));
        assert!(bad(&["--deadline", "0"]));
        assert!(bad(&["--deadline", "1e300"]));
        assert!(bad(&["--deadline", "inf"]));
        assert!(bad(&["--poll_interval", "NaN"]));
        assert!(bad(&["-s", "--workers", "4"]));
        assert!(!bad(&["-r", "5", "-S"]));
    }
}
