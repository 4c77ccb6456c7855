use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use tree::{Fetched, Fetcher, Variant};

use crate::parse_payload;

/// A [`Fetcher`] that shells out to a configured command. `fetch_one`
/// appends the key as the last argument; `fetch_all` runs the command
/// bare. External calls are serialized by an internal mutex, so the tree
/// lock dance around a fetch never runs the subprocess twice
/// concurrently.
pub struct ExecFetcher {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    ttl: Option<Duration>,
    call: Mutex<()>,
}

impl ExecFetcher {
    pub fn new(argv: Vec<String>, env: Vec<(String, String)>, ttl: Option<Duration>) -> Self {
        ExecFetcher {
            argv,
            env,
            ttl,
            call: Mutex::new(()),
        }
    }

    /// Run `argv[0] --check` and require a zero exit status.
    pub fn startup_check(&self) -> anyhow::Result<()> {
        let Some(prog) = self.argv.first() else {
            anyhow::bail!("fetcher has an empty argv");
        };
        tracing::info!(prog, "fetcher startup check");
        let status = Command::new(prog)
            .arg("--check")
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .status()
            .map_err(|e| anyhow::anyhow!("failed to spawn {prog:?}: {e}"))?;
        anyhow::ensure!(status.success(), "{prog:?} --check exited with {status}");
        Ok(())
    }

    fn run(&self, extra: Option<&str>) -> Option<Fetched> {
        let _serialized = self.call.lock().unwrap_or_else(|e| e.into_inner());
        let prog = self.argv.first()?;
        let mut cmd = Command::new(prog);
        cmd.args(&self.argv[1..]);
        if let Some(key) = extra {
            cmd.arg(key);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        let out = match cmd.output() {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(prog, error = %e, "fetcher spawn failed");
                return None;
            }
        };
        if !out.status.success() {
            tracing::error!(prog, status = %out.status, "fetcher exited nonzero");
            return None;
        }
        match parse_payload(&out.stdout) {
            Ok((pool, value)) => Some(Fetched { pool, value }),
            Err(e) => {
                tracing::error!(prog, error = %e, "fetcher produced unparseable output");
                None
            }
        }
    }
}

impl Fetcher for ExecFetcher {
    fn fetch_one(&self, key: &str) -> Option<Fetched> {
        self.run(Some(key))
    }

    fn fetch_all(&self) -> Option<Fetched> {
        let res = self.run(None)?;
        if matches!(res.value, Variant::Map(_)) {
            Some(res)
        } else {
            tracing::error!("fetch_all result is not a map; dropping it");
            None
        }
    }

    fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}
