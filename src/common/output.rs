//! Utilities for naming result files and tagging them with the settings that produced them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{offset::Local, DateTime};
use serde::{Serialize, Serializer};

/// `OutputManager` records every setting of a run so that results can always be traced back to
/// the exact configuration that produced them.
///
/// Each routine creates one at the beginning with all of its settings (the `settings!` macro
/// does this conveniently). It then generates the names of the output files and the contents of
/// the `.params` file that accompanies them.
///
/// Generated names are unique because they include a timestamp. Settings marked as `important`
/// are also included in the names.
#[derive(Debug, Clone)]
pub struct OutputManager {
    settings: BTreeMap<String, String>,
    important: Vec<String>,
    timestamp: DateTime<Local>,
}

impl OutputManager {
    pub fn new() -> Self {
        OutputManager {
            settings: BTreeMap::new(),
            important: Vec::new(),
            timestamp: Local::now(),
        }
    }

    /// Register a new setting called `name` with value `value`. If `important` is set, the
    /// setting is part of generated file names.
    ///
    /// # Panics
    ///
    /// If `name` is already registered.
    pub fn register<V: Serialize + std::fmt::Debug>(&mut self, name: &str, value: &V, important: bool) {
        let value = serde_json::to_string(value).expect("unable to serialize setting");
        if let Some(prev) = self.settings.insert(name.into(), value) {
            panic!("Setting {:?} previously registered with value {:?}", name, prev);
        }
        if important {
            self.important.push(name.into());
        }
    }

    /// The `.out` and `.params` file names, in that order.
    pub fn gen_file_names(&self) -> (String, String) {
        (self.gen_file_name("out"), self.gen_file_name("params"))
    }

    /// A file name with the given extension (without the leading dot).
    pub fn gen_file_name(&self, ext: &str) -> String {
        let mut base: Vec<String> = self
            .important
            .iter()
            .map(|setting| self.setting_tag(setting))
            .collect();

        base.push(self.timestamp.format("%Y-%m-%d-%H-%M-%S").to_string());

        format!("{}.{}", base.join("-"), ext)
    }

    /// `name` followed by its value, made safe for a file name.
    fn setting_tag(&self, setting: &str) -> String {
        let val = self.settings.get(setting).map(String::as_str).unwrap_or("");

        let val: String = val
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '"' | '\'' | '/' => '_',
                c => c,
            })
            .collect();
        let val = val.trim_matches('_');

        format!("{}{}", setting, val)
    }

    /// Write `output` and the settings into `dir`, returning the path of the output file.
    pub fn write_results(&self, dir: &Path, output: &[u8]) -> Result<PathBuf, failure::Error> {
        let (output_file, params_file) = self.gen_file_names();
        let output_path = dir.join(output_file);

        std::fs::create_dir_all(dir)?;
        std::fs::write(&output_path, output)?;
        std::fs::write(dir.join(params_file), serde_json::to_string(self)?)?;

        Ok(output_path)
    }
}

impl Serialize for OutputManager {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // The `.params` file maps each setting to its JSON-encoded value.
        serializer.collect_map(&self.settings)
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __settings_helper {
    ($manager:ident $(,)?) => {};
    ($manager:ident, $name:ident : $value:expr $(, $($tail:tt)*)?) => {{
        $manager.register(stringify!($name), &$value, false);
        $crate::__settings_helper!($manager $(, $($tail)*)?);
    }};
    ($manager:ident, * $name:ident : $value:expr $(, $($tail:tt)*)?) => {{
        $manager.register(stringify!($name), &$value, true);
        $crate::__settings_helper!($manager $(, $($tail)*)?);
    }};
}

/// Create an `OutputManager` with the given settings. The syntax is `[*] name: value`, where the
/// optional `*` marks the setting as important.
///
/// ```rust,ignore
/// let settings = settings! {
///     * vm_name: "Tiny",
///     * num_vms: 32,
///     runs: 3,
///     serially: false,
/// };
/// ```
#[macro_export]
macro_rules! settings {
    ($($tail:tt)*) => {{
        let mut manager = crate::common::output::OutputManager::new();

        $crate::__settings_helper!(manager, $($tail)*);

        manager
    }}
}
