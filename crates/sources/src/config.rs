use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// The `sources` section of the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesConfig {
    /// Ingest entries, each a file load or a subprocess.
    #[serde(default)]
    pub list: Vec<SourceEntry>,
    /// Interval for full from-scratch rebuilds; absent means never.
    #[serde(default, rename = "purgeEvery", deserialize_with = "de_duration_opt")]
    pub purge_every: Option<Duration>,
    /// On-disk cache directory for BJ snapshots.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// One ingest entry: exactly one of `exec` or `load`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    #[serde(default)]
    pub exec: Option<ArgList>,
    #[serde(default)]
    pub load: Option<PathBuf>,
    /// Refresh period; absent or zero means once per rebuild only.
    #[serde(default, deserialize_with = "de_duration_opt")]
    pub every: Option<Duration>,
    /// Run `argv[0] --check` at startup. Defaults to true for `exec`
    /// entries.
    #[serde(default)]
    pub check: Option<bool>,
}

/// A command line given as one string or an argv array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgList {
    One(String),
    Many(Vec<String>),
}

impl ArgList {
    pub fn argv(&self) -> Vec<String> {
        match self {
            ArgList::One(s) => vec![s.clone()],
            ArgList::Many(v) => v.clone(),
        }
    }
}

impl SourceEntry {
    /// A short name for logs.
    pub fn describe(&self) -> String {
        match (&self.exec, &self.load) {
            (Some(a), _) => a.argv().first().cloned().unwrap_or_default(),
            (None, Some(p)) => p.display().to_string(),
            (None, None) => "<empty>".to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.exec, &self.load) {
            (Some(a), None) => {
                anyhow::ensure!(!a.argv().is_empty(), "exec entry has an empty argv");
                Ok(())
            }
            (None, Some(_)) => Ok(()),
            _ => anyhow::bail!("a source entry needs exactly one of 'exec' or 'load'"),
        }
    }

    pub fn wants_check(&self) -> bool {
        match self.check {
            Some(c) => c,
            None => self.exec.is_some(),
        }
    }

    pub fn refresh_period(&self) -> Option<Duration> {
        self.every.filter(|d| !d.is_zero())
    }
}

/// Duration strings use `d h m s ms` units and concatenate (`2h30m5s`);
/// a bare number is milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    let s = s.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        // Parse through humantime anyway so its error type covers both
        // spellings; a digit string with a unit appended is well formed.
        return humantime::parse_duration(&format!("{s}ms"));
    }
    humantime::parse_duration(s)
}

fn de_duration_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(u64),
    }
    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(Raw::Text(s)) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations_concatenate() {
        assert_eq!(
            parse_duration("2h30m5s").unwrap(),
            Duration::from_secs(2 * 3600 + 30 * 60 + 5)
        );
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("five minutes-ish").is_err());
    }

    #[test]
    fn entries_deserialize_from_config_json() {
        let cfg: SourcesConfig = serde_json::from_str(
            r#"{
                "list": [
                    {"exec": ["/usr/bin/gen", "--json"], "every": "30s"},
                    {"exec": "gen-simple", "check": false},
                    {"load": "/var/lib/seed.json", "every": 60000}
                ],
                "purgeEvery": "2h30m",
                "directory": "/tmp/cache"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.list.len(), 3);
        assert_eq!(cfg.list[0].describe(), "/usr/bin/gen");
        assert!(cfg.list[0].wants_check());
        assert!(!cfg.list[1].wants_check());
        assert_eq!(cfg.list[2].refresh_period(), Some(Duration::from_secs(60)));
        assert_eq!(
            cfg.purge_every,
            Some(Duration::from_secs(2 * 3600 + 30 * 60))
        );
        for e in &cfg.list {
            e.validate().unwrap();
        }
    }

    #[test]
    fn ambiguous_entries_fail_validation() {
        let e: SourceEntry =
            serde_json::from_str(r#"{"exec": "a", "load": "b"}"#).unwrap();
        assert!(e.validate().is_err());
        let e: SourceEntry = serde_json::from_str(r#"{"every": "5s"}"#).unwrap();
        assert!(e.validate().is_err());
    }
}
