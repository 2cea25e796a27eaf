//! The oVirt engine REST API as a `Hypervisor`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::ACCEPT;

use serde::Deserialize;

use crate::error::BenchError;
use crate::hypervisor::Hypervisor;

/// The URL of the engine API if none is given.
pub const DEFAULT_ENGINE_URL: &str = "https://localhost/ovirt-engine/api";

/// Environment variable holding the engine password.
pub const PASSWORD_ENV: &str = "VMBENCH_ENGINE_PASSWORD";

/// How to reach the engine.
#[derive(Clone, Debug)]
pub struct OvirtConfig {
    /// Base URL of the API (e.g. `https://engine.example.com/ovirt-engine/api`).
    pub url: String,
    pub user: String,
    pub password: String,

    /// Accept self-signed engine certificates.
    pub insecure: bool,

    pub timeout: Duration,
}

/// Add the options that locate and authenticate to the engine.
pub fn engine_args(app: clap::App<'static, 'static>) -> clap::App<'static, 'static> {
    app.arg(
        clap::Arg::with_name("ENGINE")
            .long("engine")
            .takes_value(true)
            .help("The URL of the engine API (e.g. https://engine/ovirt-engine/api)"),
    )
    .arg(
        clap::Arg::with_name("USER")
            .long("user")
            .takes_value(true)
            .help("The engine user (defaults to admin@internal)"),
    )
    .arg(
        clap::Arg::with_name("PASSWORD")
            .long("password")
            .takes_value(true)
            .help("The engine password. Prefer setting VMBENCH_ENGINE_PASSWORD instead."),
    )
    .arg(
        clap::Arg::with_name("INSECURE")
            .long("insecure")
            .help("Accept self-signed engine certificates"),
    )
}

pub fn config_from(sub_m: &clap::ArgMatches<'_>) -> Result<OvirtConfig, failure::Error> {
    let password = match sub_m.value_of("PASSWORD") {
        Some(password) => password.to_owned(),
        None => std::env::var(PASSWORD_ENV).map_err(|_| {
            failure::format_err!("No engine password: pass --password or set {}", PASSWORD_ENV)
        })?,
    };

    Ok(OvirtConfig {
        url: sub_m
            .value_of("ENGINE")
            .unwrap_or(DEFAULT_ENGINE_URL)
            .to_owned(),
        user: sub_m
            .value_of("USER")
            .unwrap_or("admin@internal")
            .to_owned(),
        password,
        insecure: sub_m.is_present("INSECURE"),
        timeout: Duration::from_secs(60),
    })
}

pub struct OvirtApi {
    config: OvirtConfig,
    client: Client,

    /// VM ids by name. Names are resolved once per run.
    ids: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct VmList {
    #[serde(default)]
    vm: Vec<VmEntry>,
}

#[derive(Debug, Deserialize)]
struct VmEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<Status>,
}

/// Version 4 of the API reports the status as a plain string, older versions as an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Status {
    Plain(String),
    Nested { state: String },
}

impl Status {
    fn as_str(&self) -> &str {
        match self {
            Status::Plain(s) => s,
            Status::Nested { state } => state,
        }
    }
}

impl OvirtApi {
    pub fn new(config: OvirtConfig) -> Result<Self, failure::Error> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()?;

        Ok(OvirtApi {
            config,
            client,
            ids: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.basic_auth(&self.config.user, Some(&self.config.password))
            .header(ACCEPT, "application/json")
    }

    /// Look up the id of `vm`, caching the answer.
    fn id(&self, vm: &str, op: &'static str) -> Result<String, BenchError> {
        if let Some(id) = self.ids.lock().ok().and_then(|ids| ids.get(vm).cloned()) {
            return Ok(id);
        }

        let err = |reason: String| BenchError::api(vm, op, reason);

        let resp = self
            .authed(self.client.get(&self.url("vms")))
            .query(&[("search", format!("name={}", vm))])
            .send()
            .map_err(|e| err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(err(format!("lookup failed: HTTP {}", resp.status())));
        }
        let body = resp.text().map_err(|e| err(e.to_string()))?;

        let id = find_id(&body, vm).map_err(err)?;
        debug!("{} has id {}", vm, id);

        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(vm.to_owned(), id.clone());
        }

        Ok(id)
    }

    fn action(&self, vm: &str, op: &'static str) -> Result<(), BenchError> {
        let id = self.id(vm, op)?;

        let resp = self
            .authed(self.client.post(&self.url(&format!("vms/{}/{}", id, op))))
            .json(&serde_json::json!({}))
            .send()
            .map_err(|e| BenchError::api(vm, op, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(BenchError::api(
                vm,
                op,
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        Ok(())
    }
}

/// The id of the VM called exactly `vm` in a search result.
fn find_id(body: &str, vm: &str) -> Result<String, String> {
    let list: VmList = serde_json::from_str(body).map_err(|e| e.to_string())?;
    list.vm
        .into_iter()
        .find(|e| e.name.as_ref().map_or(true, |name| name == vm))
        .map(|e| e.id)
        .ok_or_else(|| "no such VM".to_owned())
}

fn parse_status(body: &str) -> Result<String, String> {
    let entry: VmEntry = serde_json::from_str(body).map_err(|e| e.to_string())?;
    entry
        .status
        .map(|s| s.as_str().to_owned())
        .ok_or_else(|| "no status in response".to_owned())
}

impl Hypervisor for OvirtApi {
    fn status(&self, vm: &str) -> Result<String, BenchError> {
        let id = self.id(vm, "status")?;
        let err = |reason: String| BenchError::api(vm, "status", reason);

        let resp = self
            .authed(self.client.get(&self.url(&format!("vms/{}", id))))
            .send()
            .map_err(|e| err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(err(format!("HTTP {}", resp.status())));
        }

        parse_status(&resp.text().map_err(|e| err(e.to_string()))?).map_err(err)
    }

    fn start(&self, vm: &str) -> Result<(), BenchError> {
        self.action(vm, "start")
    }

    fn stop(&self, vm: &str) -> Result<(), BenchError> {
        self.action(vm, "stop")
    }
}
