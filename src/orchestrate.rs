//! Starting, waiting for and stopping groups of VMs.

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam::channel::unbounded;

use log::{debug, error, info, warn};

use crate::common::{BenchConfig, BenchCtx, Clock};
use crate::error::BenchError;
use crate::hypervisor::VmState;
use crate::trials::TrialResult;
use crate::vm::VmHandle;

/// How start requests are issued.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum StartMode {
    /// One after the other, sleeping `stagger` between two requests.
    Serial { stagger: Duration },

    /// From a pool of `workers` threads.
    Parallel { workers: usize },
}

impl StartMode {
    pub fn from_workers(workers: Option<usize>) -> Self {
        match workers {
            None | Some(0) => StartMode::Serial {
                stagger: Duration::from_secs(0),
            },
            Some(workers) => StartMode::Parallel { workers },
        }
    }
}

/// Call `start()` exactly once on every handle and wait for all of the requests to be
/// acknowledged. Returns the first error, but only after every start has been attempted.
pub fn start(handles: &mut [VmHandle<'_>], mode: StartMode) -> Result<(), BenchError> {
    match mode {
        StartMode::Serial { stagger } => {
            let mut first_err = None;
            for (i, handle) in handles.iter_mut().enumerate() {
                if i > 0 && stagger > Duration::from_secs(0) {
                    handle.clock().sleep(stagger);
                }
                if let Err(err) = handle.start() {
                    error!("{}", err);
                    first_err.get_or_insert(err);
                }
            }
            first_err.map_or(Ok(()), Err)
        }

        StartMode::Parallel { workers } => start_parallel(handles, workers),
    }
}

fn start_parallel(handles: &mut [VmHandle<'_>], workers: usize) -> Result<(), BenchError> {
    // No more workers than there is work for, but at least one.
    let workers = workers.min(handles.len()).max(1);

    let (work_s, work_r) = unbounded();
    let (done_s, done_r) = unbounded();

    for handle in handles.iter_mut() {
        // Cannot fail: the receiver is alive.
        let _ = work_s.send(handle);
    }
    drop(work_s);

    let joined = crossbeam::scope(|s| {
        for _ in 0..workers {
            let work_r = work_r.clone();
            let done_s = done_s.clone();
            s.spawn(move |_| {
                for handle in work_r.iter() {
                    let _ = done_s.send(handle.start());
                }
            });
        }
    });
    drop(done_s);

    if joined.is_err() {
        return Err(BenchError::api("*", "start", "a start worker panicked"));
    }

    let mut first_err = None;
    for result in done_r.iter() {
        if let Err(err) = result {
            error!("{}", err);
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Start the given VMs one after the other, skipping those that are already running. Returns
/// the indices of the handles that were actually started, so that exactly those can be stopped
/// later. The indices are returned even if a start fails part way through.
pub fn start_stopped(
    handles: &mut [VmHandle<'_>],
    stagger: Duration,
) -> (Vec<usize>, Result<(), BenchError>) {
    let mut started = Vec::new();

    for (i, handle) in handles.iter_mut().enumerate() {
        match handle.is_running() {
            Ok(true) => {
                info!("{} is already running, skipping", handle.name());
                continue;
            }
            Ok(false) => {}
            Err(err) => return (started, Err(err)),
        }

        if !started.is_empty() && stagger > Duration::from_secs(0) {
            handle.clock().sleep(stagger);
        }

        match handle.start() {
            Ok(true) => {
                info!("started {}", handle.name());
                started.push(i);
            }
            Ok(false) => {}
            Err(err) => {
                // The request may have gone through.
                started.push(i);
                return (started, Err(err));
            }
        }
    }

    (started, Ok(()))
}

/// Bring up the stopped VMs among `handles`, run `action` once all of them are up (or the
/// deadline has passed), then stop exactly the VMs started here. They are stopped on every
/// path out of this function except a panic.
pub fn with_running<T, F>(
    handles: &mut [VmHandle<'_>],
    clock: &dyn Clock,
    config: &WaitConfig,
    stagger: Duration,
    action: F,
) -> Result<T, failure::Error>
where
    F: FnOnce() -> Result<T, failure::Error>,
{
    let (started, result) = start_stopped(handles, stagger);
    info!("started {} of {} VMs", started.len(), handles.len());

    let result = result.map_err(failure::Error::from).and_then(|()| {
        let outcome = wait(handles, clock, config)?;
        if !outcome.timed_out.is_empty() {
            warn!("running with VMs still down: {:?}", outcome.timed_out);
        }
        action()
    });

    stop_started(handles, &started, clock, config);

    result
}

/// Stop the VMs at `indices`. Those still booting are waited for, up to the deadline, since only
/// a VM that is up can be stopped. Errors are only logged.
fn stop_started(
    handles: &mut [VmHandle<'_>],
    indices: &[usize],
    clock: &dyn Clock,
    config: &WaitConfig,
) {
    let begin = clock.now();
    let mut pending = indices.to_vec();

    loop {
        pending.retain(|&i| {
            let handle = &mut handles[i];
            match handle.observe() {
                Ok(observation) if observation.state == VmState::PoweringUp => true,
                Ok(observation) if observation.state == VmState::Up => {
                    if let Err(err) = handle.stop() {
                        warn!("unable to stop {}: {}", handle.name(), err);
                    }
                    false
                }
                Ok(_) => false,
                Err(err) => {
                    warn!("unable to stop {}: {}", handle.name(), err);
                    false
                }
            }
        });

        if pending.is_empty() {
            return;
        }
        if clock.now() - begin >= config.deadline.as_secs_f64() {
            break;
        }
        clock.sleep(config.poll_interval);
    }

    warn!(
        "left booting: {}",
        pending
            .iter()
            .map(|&i| handles[i].name())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

#[derive(Clone, Debug)]
pub struct WaitConfig {
    /// The state every VM has to reach.
    pub target: VmState,
    pub poll_interval: Duration,

    /// Give up once this much time has passed and a sweep still finds pending VMs.
    pub deadline: Duration,
}

impl WaitConfig {
    /// Wait for the VMs to come up, with the timing of the given benchmark configuration.
    pub fn up(config: &BenchConfig) -> Self {
        WaitConfig {
            target: VmState::Up,
            poll_interval: config.poll_interval,
            deadline: config.deadline,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaitOutcome {
    /// Number of poll sweeps performed.
    pub steps: usize,

    /// VMs that reached the target state, in handle order.
    pub ready: Vec<String>,

    /// VMs still pending when the deadline passed, in handle order.
    pub timed_out: Vec<String>,

    /// Number of pending VMs after each sweep.
    pub pending_history: Vec<usize>,
}

/// Poll all handles until each has reached `config.target` or the deadline has passed. Each step
/// sleeps for the poll interval, then observes every VM that is still pending.
pub fn wait(
    handles: &mut [VmHandle<'_>],
    clock: &dyn Clock,
    config: &WaitConfig,
) -> Result<WaitOutcome, BenchError> {
    let begin = clock.now();
    let deadline = config.deadline.as_secs_f64();

    let mut pending: Vec<usize> = (0..handles.len()).collect();
    let mut steps = 0;
    let mut pending_history = vec![];

    while !pending.is_empty() {
        clock.sleep(config.poll_interval);
        steps += 1;

        let mut still_pending = Vec::with_capacity(pending.len());
        for &i in pending.iter() {
            let observation = handles[i].observe()?;
            if let Some(mark) = observation.newly_marked {
                debug!(
                    "{}: {} after {:.1}s",
                    handles[i].name(),
                    mark.as_str(),
                    clock.now() - begin
                );
            }
            if observation.state != config.target {
                still_pending.push(i);
            }
        }
        pending = still_pending;
        pending_history.push(pending.len());

        info!(
            "step #{:02}: still pending: {} VMs ({})",
            steps,
            pending.len(),
            pending
                .iter()
                .map(|&i| handles[i].name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if !pending.is_empty() && clock.now() - begin >= deadline {
            warn!(
                "deadline of {:?} passed with {} VMs pending",
                config.deadline,
                pending.len()
            );
            break;
        }
    }

    let mut ready = vec![];
    let mut timed_out = vec![];
    for (i, handle) in handles.iter().enumerate() {
        if pending.contains(&i) {
            timed_out.push(handle.name().to_owned());
        } else {
            ready.push(handle.name().to_owned());
        }
    }

    Ok(WaitOutcome {
        steps,
        ready,
        timed_out,
        pending_history,
    })
}

/// Stop every handle, in order. Stops at the first error.
pub fn stop(handles: &mut [VmHandle<'_>]) -> Result<(), BenchError> {
    for handle in handles.iter_mut() {
        handle.stop()?;
    }
    Ok(())
}

/// Like `stop`, but keeps going after errors, which are only logged.
pub fn stop_best_effort(handles: &mut [VmHandle<'_>]) {
    for handle in handles.iter_mut() {
        if let Err(err) = handle.stop() {
            warn!("unable to stop {}: {}", handle.name(), err);
        }
    }
}

/// One trial: start all VMs of the configuration, wait for them to come up, stop them, and
/// report how long each one took.
pub fn mass_start(ctx: &BenchCtx, trial: usize) -> Result<TrialResult, BenchError> {
    let mut handles = ctx.handles();
    info!("trial {}: starting {} VMs", trial, handles.len());

    start(&mut handles, StartMode::from_workers(ctx.config.workers))?;

    let outcome = wait(&mut handles, &*ctx.clock, &WaitConfig::up(&ctx.config))?;
    info!("trial {}: done waiting after {} steps", trial, outcome.steps);

    if !outcome.timed_out.is_empty() {
        stop_best_effort(&mut handles);
        return Err(BenchError::Timeout {
            ready: outcome.ready,
            timed_out: outcome.timed_out,
        });
    }

    for h in &handles {
        debug!("{}: {:?}", h.name(), h.marks());
    }

    let result = handles
        .iter()
        .map(|h| Ok((h.name().to_owned(), h.startup_time()?)))
        .collect::<Result<BTreeMap<_, _>, BenchError>>()?;

    stop(&mut handles)?;

    Ok(result)
}
