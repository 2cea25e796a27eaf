//! Benchmarks how long groups of VMs take to boot on an oVirt engine, and records the resource
//! usage of a host's virtualization stack while they run. Which routine is chosen by passing
//! different command line arguments.

// Useful common routines
#[macro_use]
mod common;

mod error;

mod hypervisor;
mod ovirt;
mod vm;

mod orchestrate;
mod trials;

mod monitor;
mod samples;

// Routines
mod bench;
mod observe;
mod stats;

fn run() -> Result<(), failure::Error> {
    let matches = clap::App::new("vmbench")
        .about(
            "Benchmarks VM boot latency on an oVirt engine. Which routine is chosen by passing \
             different command line arguments. certain routines require extra arguments.",
        )
        .subcommand(bench::cli_options())
        .subcommand(observe::cli_options())
        .subcommand(stats::cli_options())
        .setting(clap::AppSettings::SubcommandRequired)
        .setting(clap::AppSettings::DisableVersion)
        .get_matches();

    match matches.subcommand() {
        ("bench", Some(sub_m)) => bench::run(sub_m),
        ("observe", Some(sub_m)) => observe::run(sub_m),
        ("stats", Some(sub_m)) => stats::run(sub_m),

        _ => {
            unreachable!();
        }
    }
}

fn main() {
    use console::style;

    env_logger::init();

    // Always collect backtraces.
    std::env::set_var("RUST_BACKTRACE", "1");

    if let Err(err) = run() {
        const MESSAGE: &str =
r#"== ERROR ==================================================================================
`vmbench` encountered an error. The log above may offer clues. Setting RUST_LOG=debug shows every
request sent to the engine and every command run over SSH. If VMs were left running, stop them
before the next run, as they skew the measurements."#;

        println!("{}", style(MESSAGE).red().bold());

        if err.downcast_ref::<spurs::SshError>().is_some() {
            println!("An error occurred while attempting to run a command over SSH");
        }

        println!(
            "`vmbench` encountered the following error:\n{}\n{}",
            err.as_fail(),
            err.backtrace(),
        );

        std::process::exit(101);
    }
}
