//! Repeated trials, their aggregation and rank statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use log::{info, warn};

use crate::error::BenchError;

/// Startup latency in seconds, by VM name.
pub type TrialResult = BTreeMap<String, f64>;

/// Per-VM latencies across trials, in trial order. Every VM has exactly one value per completed
/// trial.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregate {
    values: BTreeMap<String, Vec<f64>>,
    trials: usize,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trials folded in so far.
    pub fn trials(&self) -> usize {
        self.trials
    }

    pub fn values(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.values
    }

    /// Append one trial. The first trial fixes the set of VMs; a later trial with a different
    /// set is rejected as a whole and the aggregate is left untouched.
    pub fn push(&mut self, trial: TrialResult) -> Result<(), BenchError> {
        if self.trials > 0 && !trial.keys().eq(self.values.keys()) {
            return Err(BenchError::IncompleteTrial {
                expected: self.values.keys().cloned().collect(),
                got: trial.keys().cloned().collect(),
            });
        }

        for (name, value) in trial {
            self.values.entry(name).or_insert_with(Vec::new).push(value);
        }
        self.trials += 1;

        Ok(())
    }
}

/// Run `action` exactly `trials` times, folding each result into an aggregate. The first failing
/// trial aborts the run. Trials that do not cover the same VMs as the first one are discarded.
pub fn run_trials<F>(trials: usize, mut action: F) -> Result<Aggregate, failure::Error>
where
    F: FnMut(usize) -> Result<TrialResult, failure::Error>,
{
    let mut results = vec![];
    let mut timers = vec![];

    for i in 0..trials {
        results.push(time!(timers, format!("Trial {}", i), action(i)?));
    }

    let aggregate = aggregate(results);

    info!(
        "{} of {} trials completed\n{}",
        aggregate.trials(),
        trials,
        crate::common::timings_str(&timers)
    );

    Ok(aggregate)
}

/// Fold the given trials into an aggregate, discarding (with a warning) any trial that does not
/// cover the VMs of the first one.
pub fn aggregate<I: IntoIterator<Item = TrialResult>>(trial_results: I) -> Aggregate {
    let mut aggregate = Aggregate::new();

    for (i, trial) in trial_results.into_iter().enumerate() {
        if let Err(err) = aggregate.push(trial) {
            warn!("discarding trial {}: {}", i, err);
        }
    }

    aggregate
}

/// Statistics of one series of per-trial values.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesStats {
    /// One value per trial.
    pub values: Vec<f64>,
    pub mean: f64,

    /// Sample variance, standard deviation and coefficient of variation (in percent). Undefined
    /// with fewer than two trials.
    pub variance: Option<f64>,
    pub sd: Option<f64>,
    pub cv: Option<f64>,
}

impl SeriesStats {
    fn of(values: Vec<f64>) -> Self {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;

        let variance = if values.len() >= 2 {
            Some(values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0))
        } else {
            None
        };
        let sd = variance.map(f64::sqrt);
        let cv = sd.map(|sd| 100.0 * sd / mean);

        SeriesStats {
            values,
            mean,
            variance,
            sd,
            cv,
        }
    }
}

/// Rank statistics of an aggregate: for every trial, the mean, best, worst and total latency over
/// all VMs, and statistics of each of these four series across trials.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub trials: usize,
    pub vms: usize,

    /// Keyed by `best`, `mean`, `total` and `worst`. Empty if there were no trials.
    pub stats: BTreeMap<&'static str, SeriesStats>,
}

pub fn summarize(aggregate: &Aggregate) -> Summary {
    let mut stats = BTreeMap::new();

    if aggregate.trials() > 0 && !aggregate.values().is_empty() {
        let mut mean = vec![];
        let mut best = vec![];
        let mut worst = vec![];
        let mut total = vec![];

        for trial in 0..aggregate.trials() {
            let mut values: Vec<f64> = aggregate.values().values().map(|v| v[trial]).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let sum: f64 = values.iter().sum();
            mean.push(sum / values.len() as f64);
            best.push(values[0]);
            worst.push(values[values.len() - 1]);
            total.push(sum);
        }

        stats.insert("mean", SeriesStats::of(mean));
        stats.insert("best", SeriesStats::of(best));
        stats.insert("worst", SeriesStats::of(worst));
        stats.insert("total", SeriesStats::of(total));
    }

    Summary {
        trials: aggregate.trials(),
        vms: aggregate.values().len(),
        stats,
    }
}

impl Summary {
    /// One line per statistic, sorted by label, preceded by the source of the data.
    pub fn render(&self, source: &str) -> String {
        let mut out = format!(
            "source: {} ({} VMs, {} trials)\n",
            source, self.vms, self.trials
        );

        for (label, stats) in &self.stats {
            let sd = stats
                .sd
                .map_or_else(|| "n/a".to_owned(), |sd| format!("{:.3}s", sd));
            let cv = stats
                .cv
                .map_or_else(|| "n/a".to_owned(), |cv| format!("{:.1}%", cv));
            out.push_str(&format!(
                "{}:\t{:.3}s sd={} ({})\n",
                label, stats.mean, sd, cv
            ));
        }

        out
    }
}

/// Write the aggregate as tab-separated `name\tv1\tv2...` lines, sorted by name.
pub fn dump<W: Write>(aggregate: &Aggregate, out: &mut W) -> std::io::Result<()> {
    for (name, values) in aggregate.values() {
        write!(out, "{}", name)?;
        for v in values {
            write!(out, "\t{:.6}", v)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Read an aggregate written by `dump`.
pub fn parse(path: &Path) -> Result<Aggregate, failure::Error> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_str(&text)?)
}

pub fn parse_str(text: &str) -> Result<Aggregate, BenchError> {
    let mut values = BTreeMap::new();
    let mut trials = None;
    let mut seen = BTreeSet::new();

    for (i, line) in text.lines().enumerate() {
        let err = |reason: String| BenchError::Parse {
            line: i + 1,
            text: line.to_owned(),
            reason,
        };

        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.trim_end().split('\t');
        let name = match fields.next() {
            Some(name) if !name.trim().is_empty() => name.trim().to_owned(),
            _ => return Err(err("missing VM name".into())),
        };

        let row = fields
            .map(|f| f.trim().parse::<f64>().map_err(|e| err(format!("{}", e))))
            .collect::<Result<Vec<_>, _>>()?;
        if row.is_empty() {
            return Err(err("no values".into()));
        }

        match trials {
            None => trials = Some(row.len()),
            Some(n) if n != row.len() => {
                return Err(err(format!("expected {} values, found {}", n, row.len())))
            }
            Some(_) => {}
        }

        if !seen.insert(name.clone()) {
            return Err(err(format!("duplicate VM {}", name)));
        }
        values.insert(name, row);
    }

    Ok(Aggregate {
        values,
        trials: trials.unwrap_or(0),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn trial(values: &[(&str, f64)]) -> TrialResult {
        values.iter().map(|&(n, v)| (n.to_owned(), v)).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn two_trials() {
        let agg = aggregate(vec![
            trial(&[("A", 1.0), ("B", 2.0)]),
            trial(&[("A", 3.0), ("B", 4.0)]),
        ]);
        assert_eq!(agg.trials(), 2);
        assert_eq!(agg.values()["A"], vec![1.0, 3.0]);

        let summary = summarize(&agg);
        assert_eq!(summary.stats["mean"].values, vec![1.5, 3.5]);
        assert_eq!(summary.stats["best"].values, vec![1.0, 3.0]);
        assert_eq!(summary.stats["worst"].values, vec![2.0, 4.0]);
        assert_eq!(summary.stats["total"].values, vec![3.0, 7.0]);
        assert!(close(summary.stats["mean"].mean, 2.5));

        // Sample variance of [1.5, 3.5] is 2.
        assert!(close(summary.stats["mean"].variance.unwrap(), 2.0));
        assert!(close(summary.stats["mean"].sd.unwrap(), 2f64.sqrt()));
        assert!(close(
            summary.stats["mean"].cv.unwrap(),
            100.0 * 2f64.sqrt() / 2.5
        ));
    }

    #[test]
    fn order_invariance() {
        let a = trial(&[("Tiny0", 1.0), ("Tiny1", 5.0), ("Tiny2", 3.0)]);
        let b = trial(&[("Tiny0", 3.0), ("Tiny1", 1.0), ("Tiny2", 5.0)]);
        let c = trial(&[("Tiny0", 2.0), ("Tiny1", 4.0), ("Tiny2", 6.0)]);
        let d = trial(&[("Tiny0", 4.0), ("Tiny1", 6.0), ("Tiny2", 2.0)]);

        let s1 = summarize(&aggregate(vec![a, c]));
        let s2 = summarize(&aggregate(vec![b, d]));

        // Same multisets of values per trial, assigned to different VMs.
        assert_eq!(s1.stats, s2.stats);
    }

    #[test]
    fn single_trial_has_no_spread() {
        let summary = summarize(&aggregate(vec![trial(&[("A", 1.0), ("B", 3.0)])]));
        assert_eq!(summary.stats["mean"].mean, 2.0);
        assert_eq!(summary.stats["mean"].sd, None);
        assert_eq!(summary.stats["mean"].cv, None);

        let text = summary.render("test");
        assert!(text.contains("mean:\t2.000s sd=n/a (n/a)"));
    }

    #[test]
    fn render() {
        let agg = aggregate(vec![
            trial(&[("A", 1.0), ("B", 2.0)]),
            trial(&[("A", 3.0), ("B", 4.0)]),
        ]);
        let text = summarize(&agg).render("run.out");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "source: run.out (2 VMs, 2 trials)");
        let labels: Vec<&str> = lines[1..]
            .iter()
            .map(|l| l.split(':').next().unwrap())
            .collect();
        assert_eq!(labels, vec!["best", "mean", "total", "worst"]);
        assert_eq!(lines[2], "mean:\t2.500s sd=1.414s (56.6%)");
    }

    #[test]
    fn empty() {
        let summary = summarize(&Aggregate::new());
        assert!(summary.stats.is_empty());
        assert_eq!(summary.render("x"), "source: x (0 VMs, 0 trials)\n");
    }

    #[test]
    fn incomplete_trial_is_discarded() {
        let agg = aggregate(vec![
            trial(&[("A", 1.0), ("B", 2.0)]),
            trial(&[("A", 3.0)]),
            trial(&[("A", 5.0), ("B", 6.0), ("C", 7.0)]),
            trial(&[("A", 3.0), ("B", 4.0)]),
        ]);
        assert_eq!(agg.trials(), 2);
        assert_eq!(agg.values()["A"], vec![1.0, 3.0]);
        assert_eq!(agg.values()["B"], vec![2.0, 4.0]);
        assert!(!agg.values().contains_key("C"));

        let mut agg = Aggregate::new();
        agg.push(trial(&[("A", 1.0)])).unwrap();
        match agg.push(trial(&[("B", 1.0)])) {
            Err(BenchError::IncompleteTrial { expected, got }) => {
                assert_eq!(expected, vec!["A"]);
                assert_eq!(got, vec!["B"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn dump_and_parse() {
        let agg = aggregate(vec![
            trial(&[("Tiny1", 2.25), ("Tiny0", 1.5)]),
            trial(&[("Tiny1", 4.0), ("Tiny0", 3.125)]),
        ]);

        let mut out = Vec::new();
        dump(&agg, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Tiny0\t1.500000\t3.125000\nTiny1\t2.250000\t4.000000\n"
        );

        assert_eq!(parse_str(&text).unwrap(), agg);
        assert_eq!(parse_str(&format!("\n{}\n\n", text)).unwrap(), agg);
    }

    #[test]
    fn parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.out");
        std::fs::write(&path, "A\t1.0\t2.0\nB\t3.0\t4.0\n").unwrap();

        let agg = parse(&path).unwrap();
        assert_eq!(agg.trials(), 2);
        assert_eq!(agg.values()["B"], vec![3.0, 4.0]);
    }

    #[test]
    fn parse_errors() {
        match parse_str("A\t1.0\t2.0\n\nB\t3.0\tfast\n") {
            Err(BenchError::Parse { line, text, .. }) => {
                assert_eq!(line, 3);
                assert_eq!(text, "B\t3.0\tfast");
            }
            other => panic!("unexpected: {:?}", other),
        }

        match parse_str("A\t1.0\t2.0\nB\t3.0\n") {
            Err(BenchError::Parse { line, reason, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(reason, "expected 2 values, found 1");
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(parse_str("A\t1.0\nA\t2.0\n").is_err());
    }

    #[test]
    fn trials_run_exactly_n_times() {
        let mut calls = vec![];
        let agg = run_trials(3, |i| {
            calls.push(i);
            Ok(trial(&[("A", i as f64)]))
        })
        .unwrap();
        assert_eq!(calls, vec![0, 1, 2]);
        assert_eq!(agg.values()["A"], vec![0.0, 1.0, 2.0]);

        let mut calls = 0;
        let res = run_trials(5, |i| {
            calls += 1;
            if i == 1 {
                Err(BenchError::NeverReady { vm: "A".into() }.into())
            } else {
                Ok(trial(&[("A", 1.0)]))
            }
        });
        assert!(res.is_err());
        assert_eq!(calls, 2);
    }
}
