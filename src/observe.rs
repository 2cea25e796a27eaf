//! Keep a number of VMs running on a host and record the resource usage of the host's
//! virtualization stack meanwhile, either while idle or while running boot trials.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::clap_app;

use crate::{
    bench::{self, is_secs, is_usize},
    common::{BenchConfig, BenchCtx, Login, SystemClock, Username},
    monitor::{idle, monitor, MonitorConfig, SshRemote},
    orchestrate::{mass_start, with_running, WaitConfig},
    ovirt::{self, OvirtApi},
    samples,
    trials::{dump, run_trials, summarize},
};

/// Pause between two start requests for the background VMs.
const STAGGER: Duration = Duration::from_secs(1);

/// Progress is logged this often while idling.
const IDLE_CHUNK: Duration = Duration::from_secs(10);

pub fn cli_options() -> clap::App<'static, 'static> {
    let app = clap_app! { observe =>
        (about: "Start VMs on a host and record the resource usage of its virtualization stack \
                 with `vmmon` while they run. Only the VMs started here are stopped afterwards.")
        (@arg HOSTNAME: +required +takes_value
         "The domain name of the host running the VMs (e.g. host1.example.com:22)")
        (@arg USERNAME: +required +takes_value
         "The username on the host (e.g. markm)")
        (@group ACTION =>
            (@arg MINUTES: -m --minutes +takes_value {is_secs}
             "Idle for this many minutes while recording (defaults to 10)")
            (@arg BENCH: --bench +takes_value {is_usize}
             "Instead of idling, run this many boot trials while recording")
        )
        (@arg BENCH_VMS: --bench_vms +takes_value {is_usize}
         "The number of VMs per boot trial, named after the observed ones (defaults to 8)")
        (@arg OUT: -o --out +takes_value
         "Write the recorded samples to this file (defaults to a generated name)")
        (@arg WORKDIR: --workdir +takes_value
         "Directory on the host for the sampler's files (defaults to $HOME)")
        (@arg VMMON_PATH: --vmmon_path +takes_value
         "Directory on the host containing `vmmon`, if it is not in the PATH")
        (@arg INTERVAL: -i --interval +takes_value {is_secs}
         "Seconds between two samples (defaults to the sampler's default)")
    };

    ovirt::engine_args(bench::vm_args(app))
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let login = Login {
        username: Username(sub_m.value_of("USERNAME").unwrap()),
        hostname: sub_m.value_of("HOSTNAME").unwrap(),
    };

    let minutes = sub_m
        .value_of("MINUTES")
        .map(|v| v.parse::<f64>())
        .transpose()?
        .unwrap_or(10.0);
    let bench_runs = sub_m
        .value_of("BENCH")
        .map(|v| v.parse::<usize>())
        .transpose()?;
    let bench_vms = sub_m
        .value_of("BENCH_VMS")
        .map(|v| v.parse::<usize>())
        .transpose()?
        .unwrap_or(8);

    let config = bench::config_from(sub_m);
    let engine = ovirt::config_from(sub_m)?;

    let monitor_config = MonitorConfig {
        workdir: sub_m
            .value_of("WORKDIR")
            .map(String::from)
            .unwrap_or_else(|| MonitorConfig::default().workdir),
        extra_path: sub_m.value_of("VMMON_PATH").map(String::from),
        interval: sub_m
            .value_of("INTERVAL")
            .map(|v| v.parse::<f64>())
            .transpose()?,
        ..MonitorConfig::default()
    };

    let settings = settings! {
        * workload: "observe",
        * vm_name: config.vm_name,
        first: config.first,
        * num_vms: config.num_vms,
        scheme: config.scheme,
        minutes: minutes,
        bench_runs: bench_runs,
        bench_vms: bench_vms,
        host: login.hostname,
        username: login.username.as_str(),
        workdir: monitor_config.workdir,
        sample_interval: monitor_config.interval,
        engine: engine.url,
    };

    let api = Arc::new(OvirtApi::new(engine)?);
    let ctx = BenchCtx::new(config, api, Arc::new(SystemClock::new()));

    // The boot trials use the VMs right after the observed ones.
    let bench_ctx = BenchCtx::new(
        BenchConfig {
            first: ctx.config.first + ctx.config.num_vms,
            num_vms: bench_vms,
            ..ctx.config.clone()
        },
        ctx.api.clone(),
        ctx.clock.clone(),
    );

    // Leave running whatever was running before, whatever happens.
    let mut handles = ctx.handles();
    let result = with_running(
        &mut handles,
        &*ctx.clock,
        &WaitConfig::up(&ctx.config),
        STAGGER,
        || {
            SshRemote::connect(&login).and_then(|remote| {
                monitor(&remote, &monitor_config, || match bench_runs {
                    Some(runs) => {
                        Ok(Some(run_trials(runs, |i| Ok(mass_start(&bench_ctx, i)?))?))
                    }
                    None => {
                        idle(
                            &*ctx.clock,
                            Duration::from_secs_f64(minutes * 60.0),
                            IDLE_CHUNK,
                        );
                        Ok(None)
                    }
                })
            })
        },
    );

    let (aggregate, data) = result?;

    let out = sub_m
        .value_of("OUT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(settings.gen_file_name("json")));
    std::fs::write(&out, &data)?;

    let recording = vmmon::parse_samples(&String::from_utf8_lossy(&data))?;
    print!(
        "{}",
        samples::summarize(&recording).render(&out.display().to_string())
    );

    if let Some(aggregate) = aggregate {
        let mut raw = Vec::new();
        dump(&aggregate, &mut raw)?;
        let dir = match out.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let path = settings.write_results(dir, &raw)?;
        print!("{}", summarize(&aggregate).render(&path.display().to_string()));
    }

    println!("RESULTS: {}", out.display());

    Ok(())
}
