//! The sampling loop.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use chrono::Utc;

use log::{debug, info};

use crate::{probe::Probe, MonError, Sample, StopToken, Tracked};

/// Settings of the sampling loop.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between two samples.
    pub interval: Duration,

    /// Flush the output every this many samples. The output is always flushed on exit.
    pub flush_every: usize,

    /// Also record per-core host usage.
    pub percpu: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: Duration::from_millis(500),
            flush_every: 60,
            percpu: false,
        }
    }
}

/// Sample `tracked` every `config.interval`, writing one JSON line per tick to `out`, until
/// `stop` is tripped. The token is checked once per tick, before measuring, so a stop request
/// that arrives during the sleep does not produce another sample.
///
/// Whatever happens, the output is flushed before returning. Returns the number of samples
/// written.
pub fn run<P: Probe, W: Write>(
    probe: &mut P,
    tracked: &[Tracked],
    out: &mut W,
    config: &SamplerConfig,
    stop: &StopToken,
) -> Result<usize, MonError> {
    // No baseline exists for the very first CPU reading, so take one now and throw it away.
    probe.prime(tracked)?;

    let start = now();
    info!("begin sampling at {:.3}", start);

    let mut ticks = 0;
    let mut last_timestamp = start;

    let result = loop {
        if stop.is_stopped() {
            break Ok(());
        }

        let sample = match take_sample(probe, tracked, config, last_timestamp) {
            Ok(sample) => sample,
            Err(err) => break Err(err),
        };
        last_timestamp = sample.timestamp;

        if let Err(err) = write_sample(out, &sample) {
            break Err(err);
        }

        ticks += 1;
        if config.flush_every > 0 && ticks % config.flush_every == 0 {
            debug!("flushing after {} samples", ticks);
            if let Err(err) = out.flush() {
                break Err(err.into());
            }
        }

        std::thread::sleep(config.interval);
    };

    out.flush()?;

    let stop_time = now();
    info!("end sampling at {:.3}", stop_time);
    info!(
        "sampled for {} seconds ({} samples)",
        (stop_time - start) as u64,
        ticks
    );

    result.map(|()| ticks)
}

fn take_sample<P: Probe>(
    probe: &mut P,
    tracked: &[Tracked],
    config: &SamplerConfig,
    last_timestamp: f64,
) -> Result<Sample, MonError> {
    // The stream is consumed as a time series, so never let the wall clock go backwards in it.
    let timestamp = now().max(last_timestamp);

    let mut host = probe.host(config.percpu);
    host.cpu = sane_percent(host.cpu);
    if let Some(percpu) = host.percpu.as_mut() {
        percpu.iter_mut().for_each(|v| *v = sane_percent(*v));
    }

    let mut processes = BTreeMap::new();
    for t in tracked {
        let mut sample = probe.process(t)?;
        sample.cpu = sane_percent(sample.cpu);
        processes.insert(t.label.clone(), sample);
    }

    Ok(Sample {
        timestamp,
        host,
        processes,
    })
}

fn write_sample<W: Write>(out: &mut W, sample: &Sample) -> Result<(), MonError> {
    serde_json::to_writer(&mut *out, sample)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// CPU percentages without a valid baseline come out as garbage; report them as idle.
fn sane_percent(v: f32) -> f32 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

fn now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;
    use crate::{parse_samples, HostSample, MemoryInfo, ProcessSample};

    /// Replays scripted CPU readings and trips the stop token after a given number of ticks, the
    /// way a signal arriving in the middle of an interval would.
    struct ScriptedProbe {
        cpu: Vec<f32>,
        tick: usize,
        primed: bool,
        stop_after: usize,
        stop: StopToken,
        vanish_at: Option<usize>,
    }

    impl ScriptedProbe {
        fn new(cpu: Vec<f32>, stop_after: usize, stop: &StopToken) -> Self {
            ScriptedProbe {
                cpu,
                tick: 0,
                primed: false,
                stop_after,
                stop: stop.clone(),
                vanish_at: None,
            }
        }
    }

    impl Probe for ScriptedProbe {
        fn prime(&mut self, _tracked: &[Tracked]) -> Result<(), MonError> {
            self.primed = true;
            Ok(())
        }

        fn host(&mut self, percpu: bool) -> HostSample {
            assert!(self.primed);
            self.tick += 1;
            if self.tick == self.stop_after {
                self.stop.stop();
            }
            HostSample {
                cpu: 50.0,
                percpu: if percpu { Some(vec![f32::NAN, 100.0]) } else { None },
            }
        }

        fn process(&mut self, tracked: &Tracked) -> Result<ProcessSample, MonError> {
            if self.vanish_at == Some(self.tick) {
                return Err(MonError::ProcessGone {
                    label: tracked.label.clone(),
                    pid: tracked.pid,
                });
            }
            Ok(ProcessSample {
                cpu: self.cpu.get(self.tick - 1).copied().unwrap_or(1.0),
                memory: MemoryInfo { rss: 10, vms: 20 },
                threads: 3,
            })
        }
    }

    fn tracked() -> Vec<Tracked> {
        vec![
            Tracked {
                label: "libvirtd".into(),
                pid: 800,
            },
            Tracked {
                label: "vdsm_main".into(),
                pid: 900,
            },
        ]
    }

    fn fast() -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(1),
            flush_every: 2,
            percpu: false,
        }
    }

    /// Counts flushes so we can tell batching from per-sample flushing.
    struct CountingSink {
        data: Vec<u8>,
        flushed_len: usize,
        flushes: usize,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            self.flushed_len = self.data.len();
            Ok(())
        }
    }

    #[test]
    fn stop_mid_interval_flushes_samples_taken() {
        let stop = StopToken::new();
        let mut probe = ScriptedProbe::new(vec![], 5, &stop);
        let mut sink = CountingSink {
            data: vec![],
            flushed_len: 0,
            flushes: 0,
        };

        let n = run(&mut probe, &tracked(), &mut sink, &fast(), &stop).unwrap();
        assert_eq!(n, 5);

        // Everything written made it out.
        assert_eq!(sink.flushed_len, sink.data.len());

        let samples = parse_samples(std::str::from_utf8(&sink.data).unwrap()).unwrap();
        assert_eq!(samples.len(), 5);
        for w in samples.windows(2) {
            assert!(w[0].timestamp <= w[1].timestamp);
        }
        assert!(samples
            .iter()
            .all(|s| s.processes.keys().map(String::as_str).eq(vec!["libvirtd", "vdsm_main"])));
    }

    #[test]
    fn flushes_are_batched() {
        let stop = StopToken::new();
        let mut probe = ScriptedProbe::new(vec![], 6, &stop);
        let mut sink = CountingSink {
            data: vec![],
            flushed_len: 0,
            flushes: 0,
        };
        let config = SamplerConfig {
            flush_every: 3,
            ..fast()
        };

        run(&mut probe, &tracked(), &mut sink, &config, &stop).unwrap();

        // After samples 3 and 6, plus the final flush.
        assert_eq!(sink.flushes, 3);
    }

    #[test]
    fn first_cpu_reading_is_defined() {
        let stop = StopToken::new();
        let mut probe = ScriptedProbe::new(vec![-1.0, f32::NAN, 25.0], 3, &stop);
        let mut out = Vec::new();

        run(&mut probe, &tracked(), &mut out, &fast(), &stop).unwrap();

        let samples = parse_samples(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(samples[0].processes["libvirtd"].cpu, 0.0);
        assert_eq!(samples[1].processes["libvirtd"].cpu, 0.0);
        assert_eq!(samples[2].processes["libvirtd"].cpu, 25.0);
        assert!(samples
            .iter()
            .flat_map(|s| s.processes.values())
            .all(|p| p.cpu >= 0.0));
    }

    #[test]
    fn percpu_readings_are_sanitized() {
        let stop = StopToken::new();
        let mut probe = ScriptedProbe::new(vec![], 1, &stop);
        let mut out = Vec::new();
        let config = SamplerConfig {
            percpu: true,
            ..fast()
        };

        run(&mut probe, &tracked(), &mut out, &config, &stop).unwrap();

        let samples = parse_samples(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(samples[0].host.percpu, Some(vec![0.0, 100.0]));
    }

    #[test]
    fn already_stopped_writes_nothing() {
        let stop = StopToken::new();
        stop.stop();
        let mut probe = ScriptedProbe::new(vec![], 100, &stop);
        let mut out = Vec::new();

        assert_eq!(run(&mut probe, &tracked(), &mut out, &fast(), &stop).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn vanished_process_keeps_earlier_samples() {
        let stop = StopToken::new();
        let mut probe = ScriptedProbe::new(vec![], 100, &stop);
        probe.vanish_at = Some(3);
        let mut sink = CountingSink {
            data: vec![],
            flushed_len: 0,
            flushes: 0,
        };

        match run(&mut probe, &tracked(), &mut sink, &fast(), &stop) {
            Err(MonError::ProcessGone { label, pid }) => {
                assert_eq!(label, "libvirtd");
                assert_eq!(pid, 800);
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert_eq!(sink.flushed_len, sink.data.len());
        let samples = parse_samples(std::str::from_utf8(&sink.data).unwrap()).unwrap();
        assert_eq!(samples.len(), 2);
    }
}
