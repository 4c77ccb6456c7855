//! Server configuration: one JSON document, read through the lenient
//! tree parser (operators keep comments and trailing commas in their
//! configs) and then deserialized into typed structs. The raw variant
//! tree is kept alongside because view definitions and the `/config`
//! debug echo consume it directly.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use sources::{parse_duration, ArgList, SourcesConfig};
use tree::{StringPool, Variant};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: Vec<Listen>,
    /// Worker thread count; 0 means `2 × CPU`, minimum 5.
    pub listen_threads: usize,
    pub expose_debug_apis: bool,
    pub fetch: BTreeMap<String, FetchSpec>,
    pub sources: SourcesConfig,
    /// Extra environment for `exec` sources and fetchers.
    pub env: BTreeMap<String, String>,
    pub reply_cache: ReplyCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: vec![Listen::default()],
            listen_threads: 0,
            expose_debug_apis: false,
            fetch: BTreeMap::new(),
            sources: SourcesConfig::default(),
            env: BTreeMap::new(),
            reply_cache: ReplyCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Listen {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
}

impl Default for Listen {
    fn default() -> Self {
        // Loopback by default; we are not MongoDB.
        Listen {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ssl: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSpec {
    pub exec: ArgList,
    #[serde(default, deserialize_with = "de_duration_opt")]
    pub every: Option<Duration>,
    #[serde(default)]
    pub check: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyCacheConfig {
    pub rows: u32,
    pub columns: u32,
    #[serde(default, deserialize_with = "de_duration_opt")]
    pub maxtime: Option<Duration>,
}

impl Default for ReplyCacheConfig {
    fn default() -> Self {
        ReplyCacheConfig {
            rows: 0,
            columns: 0,
            maxtime: None,
        }
    }
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

impl Config {
    pub fn effective_listen_threads(&self) -> usize {
        if self.listen_threads != 0 {
            return self.listen_threads;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (2 * cpus).max(5)
    }
}

/// The typed configuration plus the raw variant tree it came from.
pub struct LoadedConfig {
    pub config: Config,
    pub pool: StringPool,
    pub root: Variant,
}

impl Drop for LoadedConfig {
    fn drop(&mut self) {
        let mut root = std::mem::take(&mut self.root);
        root.clear(&mut self.pool);
    }
}

impl LoadedConfig {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<LoadedConfig> {
        let mut pool = StringPool::new();
        let root = tree::json::parse(&mut pool, bytes)
            .map_err(|e| anyhow::anyhow!("config is not valid json: {e}"))?;
        let echo = serde_json::to_value(tree::json::JsonRef {
            pool: &pool,
            v: &root,
        })?;
        let config: Config = serde_json::from_value(strip_views(echo))
            .map_err(|e| anyhow::anyhow!("config is malformed: {e}"))?;
        Ok(LoadedConfig { config, pool, root })
    }

    pub fn load(path: &Path) -> anyhow::Result<LoadedConfig> {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    /// View definitions stay in variant form; `View::load` consumes them
    /// with their pool.
    pub fn view_defs(&self) -> Vec<(String, &Variant)> {
        let mut out = Vec::new();
        if let Ok(views) = tree::subtree(&self.pool, &self.root, "/view") {
            if let Some(m) = views.map() {
                for (k, v) in m.iter() {
                    let name = self.pool.get_str(k).unwrap_or_default().to_string();
                    out.push((name, v));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Config echo for the debug endpoint.
    pub fn echo(&self) -> serde_json::Value {
        serde_json::to_value(tree::json::JsonRef {
            pool: &self.pool,
            v: &self.root,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The `view` key holds arbitrary query text, not config structure;
/// remove it before the typed deserialization.
fn strip_views(mut v: serde_json::Value) -> serde_json::Value {
    if let Some(m) = v.as_object_mut() {
        m.remove("view");
    }
    v
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let lc = LoadedConfig::from_bytes(b"{}").unwrap();
        assert_eq!(lc.config.listen.len(), 1);
        assert_eq!(lc.config.listen[0].port, 8080);
        assert!(!lc.config.expose_debug_apis);
        assert!(lc.config.effective_listen_threads() >= 5);
        assert!(lc.view_defs().is_empty());
    }

    #[test]
    fn full_config_parses_with_comments() {
        let lc = LoadedConfig::from_bytes(
            br#"{
                // where to listen
                "listen": [{"host": "0.0.0.0", "port": 1234}],
                "listen_threads": 7,
                "expose_debug_apis": true,
                "view": {
                    "rooms": {"result": "/rooms[open=true]"},
                },
                "fetch": {
                    "/ext": {"exec": ["./fetch.sh"], "every": "5m"}
                },
                "sources": {
                    "list": [{"load": "/tmp/seed.json"}],
                    "purgeEvery": "1h",
                },
                "env": {"API_KEY": "k"},
                "reply_cache": {"rows": 64, "columns": 8, "maxtime": "10s"},
            }"#,
        )
        .unwrap();
        assert_eq!(lc.config.listen[0].port, 1234);
        assert_eq!(lc.config.listen_threads, 7);
        assert!(lc.config.expose_debug_apis);
        assert_eq!(lc.config.reply_cache.rows, 64);
        assert_eq!(
            lc.config.reply_cache.maxtime,
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            lc.config.sources.purge_every,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(lc.config.env.get("API_KEY").map(String::as_str), Some("k"));

        let defs = lc.view_defs();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].0, "rooms");

        let spec = lc.config.fetch.get("/ext").unwrap();
        assert_eq!(spec.every, Some(Duration::from_secs(300)));
    }

    #[test]
    fn bad_config_is_rejected() {
        assert!(LoadedConfig::from_bytes(b"[1,2,3]").is_err());
        assert!(LoadedConfig::from_bytes(b"{\"listen\": 5}").is_err());
        assert!(LoadedConfig::from_bytes(b"not json").is_err());
    }
}
