//! Summarize stored results: raw latency dumps or sampler recordings.

use std::path::Path;

use clap::clap_app;

use crate::{samples, trials};

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { stats =>
        (about: "Print rank statistics of raw result dumps, or the resource usage recorded in \
                 sample files (`.json`, `.ndjson`).")
        (@arg FILES: +required +takes_value ...
         "The files to summarize")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    for file in sub_m.values_of("FILES").unwrap() {
        print!("{}", summarize_file(Path::new(file))?);
    }

    Ok(())
}

/// Pick the kind of summary by file extension.
pub fn summarize_file(path: &Path) -> Result<String, failure::Error> {
    let source = path.display().to_string();

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") | Some("ndjson") => {
            Ok(samples::summarize(&samples::load(path)?).render(&source))
        }
        _ => Ok(trials::summarize(&trials::parse(path)?).render(&source)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let raw = dir.path().join("vm_nameTiny-2024.out");
        std::fs::write(&raw, "Tiny0\t1.000000\t3.000000\nTiny1\t2.000000\t4.000000\n").unwrap();
        let text = summarize_file(&raw).unwrap();
        assert!(text.contains("(2 VMs, 2 trials)"));
        assert!(text.contains("mean:\t2.500s"));

        let recording = dir.path().join("samples.json");
        std::fs::write(
            &recording,
            "{\"timestamp\": 1.0, \"host\": {\"cpu\": 5.0}, \"libvirtd\": {\"cpu\": 1.0, \
             \"memory\": {\"resident\": 0, \"virtual\": 0}, \"threads\": 1}}\n",
        )
        .unwrap();
        let text = summarize_file(&recording).unwrap();
        assert!(text.contains("libvirtd:\tcpu=1.0%"));

        // A sample file is not a valid raw dump, and vice versa.
        let misnamed = dir.path().join("samples.out");
        std::fs::copy(&recording, &misnamed).unwrap();
        assert!(summarize_file(&misnamed).is_err());
    }
}
