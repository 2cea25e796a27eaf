//! Summaries of the resource usage recorded by the `vmmon` sampler.

use std::collections::BTreeMap;
use std::path::Path;

use vmmon::Sample;

/// Usage of one tracked process over a whole recording.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessUsage {
    pub cpu_mean: f64,
    pub cpu_max: f64,

    /// Peak resident memory, in bytes.
    pub rss_max: u64,
    pub threads_max: u64,

    /// Number of samples that contain this process.
    pub samples: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UsageSummary {
    pub samples: usize,

    /// Seconds between the first and the last sample.
    pub duration: f64,

    pub host_cpu_mean: f64,
    pub host_cpu_max: f64,

    pub processes: BTreeMap<String, ProcessUsage>,
}

pub fn load(path: &Path) -> Result<Vec<Sample>, failure::Error> {
    let text = std::fs::read_to_string(path)?;
    Ok(vmmon::parse_samples(&text)?)
}

pub fn summarize(samples: &[Sample]) -> UsageSummary {
    let duration = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => last.timestamp - first.timestamp,
        _ => 0.0,
    };

    let host: Vec<f64> = samples.iter().map(|s| f64::from(s.host.cpu)).collect();

    let mut processes: BTreeMap<String, (Vec<f64>, u64, u64)> = BTreeMap::new();
    for sample in samples {
        for (label, p) in &sample.processes {
            let entry = processes
                .entry(label.clone())
                .or_insert_with(|| (vec![], 0, 0));
            entry.0.push(f64::from(p.cpu));
            entry.1 = entry.1.max(p.memory.rss);
            entry.2 = entry.2.max(p.threads);
        }
    }

    UsageSummary {
        samples: samples.len(),
        duration,
        host_cpu_mean: mean(&host),
        host_cpu_max: max(&host),
        processes: processes
            .into_iter()
            .map(|(label, (cpu, rss_max, threads_max))| {
                (
                    label,
                    ProcessUsage {
                        cpu_mean: mean(&cpu),
                        cpu_max: max(&cpu),
                        rss_max,
                        threads_max,
                        samples: cpu.len(),
                    },
                )
            })
            .collect(),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn max(values: &[f64]) -> f64 {
    values.iter().cloned().fold(0.0, f64::max)
}

impl UsageSummary {
    pub fn render(&self, source: &str) -> String {
        let mut out = format!(
            "source: {} ({} samples over {:.1}s)\n",
            source, self.samples, self.duration
        );
        out.push_str(&format!(
            "host:\tcpu={:.1}% max={:.1}%\n",
            self.host_cpu_mean, self.host_cpu_max
        ));

        for (label, p) in &self.processes {
            out.push_str(&format!(
                "{}:\tcpu={:.1}% max={:.1}% rss_max={:.1}MiB threads_max={}\n",
                label,
                p.cpu_mean,
                p.cpu_max,
                p.rss_max as f64 / (1 << 20) as f64,
                p.threads_max
            ));
        }

        out
    }
}
