use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use tree::{MergeFlags, Tree, TreeData, Variant};

use crate::config::{SourceEntry, SourcesConfig};
use crate::parse_payload;

const SNAPSHOT_FILE: &str = "snapshot.bj";

type Listener = Box<dyn Fn(&TreeData) + Send + Sync>;

/// Pulls configured sources into the shared tree.
///
/// Periodic entries merge incrementally under the write lock; at every
/// purge interval the whole tree is rebuilt from scratch in parallel and
/// swapped in with a single flat merge. Rebuild listeners run on scoped
/// threads while the read lock is held, so they observe the new tree
/// atomically with respect to writers.
pub struct Ingester {
    tree: Arc<Tree>,
    cfg: SourcesConfig,
    env: Vec<(String, String)>,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl Ingester {
    pub fn new(tree: Arc<Tree>, cfg: SourcesConfig, env: Vec<(String, String)>) -> Arc<Self> {
        Arc::new(Ingester {
            tree,
            cfg,
            env,
            listeners: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Register a callback for the tree-rebuilt event. It runs with the
    /// tree read-locked.
    pub fn add_listener(&self, l: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(l);
    }

    /// Validate configuration and run `--check` subprocesses. A failure
    /// here aborts startup.
    pub async fn startup_checks(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.cfg.list.is_empty(),
            "the sources list is empty; nothing would ever populate the tree"
        );
        for entry in &self.cfg.list {
            entry.validate()?;
            if !entry.wants_check() {
                continue;
            }
            let Some(exec) = &entry.exec else { continue };
            let argv = exec.argv();
            let prog = argv[0].clone();
            tracing::info!(prog = %prog, "startup check: {prog} --check");
            let status = tokio::process::Command::new(&prog)
                .arg("--check")
                .envs(self.env.iter().map(|(k, v)| (k.clone(), v.clone())))
                .status()
                .await
                .map_err(|e| anyhow::anyhow!("failed to spawn {prog:?}: {e}"))?;
            anyhow::ensure!(status.success(), "{prog:?} --check exited with {status}");
        }
        Ok(())
    }

    /// Populate the tree for the first time: best-effort snapshot load,
    /// then a full rebuild.
    pub async fn initial_build(&self) {
        self.load_snapshot().await;
        if !self.rebuild().await {
            tracing::error!("initial tree build failed; serving whatever loaded");
        }
    }

    /// The supervisor: launches due ingests, sleeps until the next due or
    /// purge instant, rebuilds at purge time, and exits cooperatively on
    /// shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let entries = self.cfg.list.clone();
        let far_future = Duration::from_secs(3600 * 24 * 365);

        'outer: loop {
            let now = Instant::now();
            let mut next_due: Vec<Option<Instant>> = entries
                .iter()
                .map(|e| e.refresh_period().map(|p| now + p))
                .collect();
            let purge_at = self.cfg.purge_every.map(|p| now + p);

            loop {
                let mut wake = purge_at.unwrap_or_else(|| Instant::now() + far_future);
                for due in next_due.iter().flatten() {
                    wake = wake.min(*due);
                }

                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("ingest supervisor exiting");
                            break 'outer;
                        }
                        continue;
                    }
                }

                let now = Instant::now();
                if matches!(purge_at, Some(p) if now >= p) {
                    tracing::info!("purge interval reached; rebuilding tree");
                    if !self.rebuild().await {
                        tracing::error!("tree rebuild failed; keeping the previous tree");
                    }
                    // A rebuild resets every schedule.
                    continue 'outer;
                }

                let mut jobs = Vec::new();
                for (i, due) in next_due.iter_mut().enumerate() {
                    let Some(when) = *due else { continue };
                    if now < when {
                        continue;
                    }
                    let period = entries[i].refresh_period().unwrap_or(far_future);
                    *due = Some(now + period);
                    jobs.push(tokio::spawn(ingest_entry(
                        entries[i].clone(),
                        self.env.clone(),
                        self.tree.clone(),
                    )));
                }
                for j in jobs {
                    let _ = j.await;
                }
            }
        }
    }

    /// Rebuild the whole tree into a fresh one and swap it in. Returns
    /// false (leaving the live tree untouched) if any entry fails.
    pub async fn rebuild(&self) -> bool {
        let fresh = Arc::new(Tree::new());

        let mut jobs = Vec::new();
        for entry in self.cfg.list.clone() {
            jobs.push(tokio::spawn(ingest_entry(
                entry,
                self.env.clone(),
                fresh.clone(),
            )));
        }
        let mut failures = 0usize;
        for j in jobs {
            match j.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::error!(error = %e, "rebuild ingest failed");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(error = %e, "rebuild task died");
                }
            }
        }
        if failures > 0 {
            return false;
        }

        // Swap under one write lock, then notify listeners under the read
        // lock. Both involve std locks, so run on a blocking thread.
        let tree = self.tree.clone();
        let listeners = self.listeners.clone();
        let swapped = tokio::task::spawn_blocking(move || {
            {
                let mut guard = tree.write();
                let data = &mut *guard;
                let old = std::mem::replace(&mut data.root, Variant::new_map());
                let fresh_data = fresh.read();
                if let Err(e) = tree::merge_root(
                    &mut data.pool,
                    &mut data.root,
                    &fresh_data.pool,
                    &fresh_data.root,
                    MergeFlags::FLAT,
                ) {
                    tracing::error!(error = %e, "swap merge failed");
                }
                // The old root dies only now, so strings shared between
                // the generations stayed interned during the merge.
                let mut old = old;
                old.clear(&mut data.pool);
                data.pool.defrag();
            }
            notify_rebuilt(&tree, &listeners);
        })
        .await;
        if let Err(e) = swapped {
            tracing::error!(error = %e, "rebuild swap task failed");
            return false;
        }

        self.save_snapshot().await;
        true
    }

    async fn load_snapshot(&self) {
        let Some(dir) = &self.cfg.directory else { return };
        let path = dir.join(SNAPSHOT_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(_) => return,
        };
        match parse_payload(&bytes) {
            Ok((pool, v)) => {
                let mut pool = pool;
                let mut v = v;
                let res = self.tree.write().merge(&pool, &v, MergeFlags::FLAT);
                v.clear(&mut pool);
                match res {
                    Ok(()) => tracing::info!(path = %path.display(), "loaded snapshot"),
                    Err(e) => tracing::warn!(error = %e, "snapshot merge failed"),
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "snapshot unreadable; ignoring");
            }
        }
    }

    async fn save_snapshot(&self) {
        let Some(dir) = &self.cfg.directory else { return };
        let dir = dir.clone();
        let tree = self.tree.clone();
        let res = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(SNAPSHOT_FILE);
            let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
            {
                let data = tree.read();
                let mut out = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
                bj::encode(&mut out, &data.pool, &data.root)?;
            }
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await;
        match res {
            Ok(Ok(())) => tracing::debug!("snapshot saved"),
            Ok(Err(e)) => tracing::warn!(error = %e, "snapshot save failed"),
            Err(e) => tracing::warn!(error = %e, "snapshot task failed"),
        }
    }
}

/// Dispatch the tree-rebuilt event: each listener runs on its own scoped
/// thread while the shared read lock is held, so all of them observe the
/// freshly swapped tree.
fn notify_rebuilt(tree: &Tree, listeners: &Mutex<Vec<Listener>>) {
    let listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
    if listeners.is_empty() {
        return;
    }
    let data = tree.read();
    std::thread::scope(|s| {
        for l in listeners.iter() {
            let data = &*data;
            s.spawn(move || l(data));
        }
    });
}

/// Pull one entry and merge its `data` subtree into `target`. An error
/// leaves the target untouched.
async fn ingest_entry(
    entry: SourceEntry,
    env: Vec<(String, String)>,
    target: Arc<Tree>,
) -> anyhow::Result<()> {
    let name = entry.describe();
    let started = std::time::Instant::now();
    let bytes = pull_bytes(&entry, &env).await?;
    let (pool, mut root) = parse_payload(&bytes)?;

    let result = (|| -> anyhow::Result<()> {
        let data = match root.map().and_then(|m| m.get_bytes(&pool, b"data")) {
            Some(d) => d,
            None => anyhow::bail!("payload has no 'data' key"),
        };
        anyhow::ensure!(
            matches!(data, Variant::Map(_)),
            "value under 'data' is not a map"
        );
        target
            .write()
            .merge(&pool, data, MergeFlags::RECURSIVE)
            .map_err(|e| anyhow::anyhow!("merge failed: {e}"))?;
        Ok(())
    })();

    let mut pool = pool;
    root.clear(&mut pool);
    match &result {
        Ok(()) => tracing::info!(
            source = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingested"
        ),
        Err(e) => tracing::error!(source = %name, error = %e, "ingest failed; tree unchanged"),
    }
    result
}

async fn pull_bytes(entry: &SourceEntry, env: &[(String, String)]) -> anyhow::Result<Vec<u8>> {
    if let Some(path) = &entry.load {
        return Ok(tokio::fs::read(path).await?);
    }
    let Some(exec) = &entry.exec else {
        anyhow::bail!("entry has neither 'exec' nor 'load'");
    };
    let argv = exec.argv();
    anyhow::ensure!(!argv.is_empty(), "empty argv");
    let out = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .output()
        .await?;
    anyhow::ensure!(
        out.status.success(),
        "{:?} exited with {}: {}",
        argv[0],
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(out.stdout)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn load_entry(path: std::path::PathBuf, every: Option<Duration>) -> SourceEntry {
        SourceEntry {
            exec: None,
            load: Some(path),
            every,
            check: None,
        }
    }

    #[tokio::test]
    async fn file_ingest_merges_data_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.json", r#"{"data": {"users": {"a": 1}}}"#);

        let tree = Arc::new(Tree::new());
        ingest_entry(load_entry(path, None), Vec::new(), tree.clone())
            .await
            .unwrap();
        let d = tree.read();
        assert!(matches!(d.subtree("/users/a"), Ok(Variant::Uint(1))));
    }

    #[tokio::test]
    async fn payload_without_data_map_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let no_data = write_file(&dir, "no.json", r#"{"users": {}}"#);
        let bad_data = write_file(&dir, "bad.json", r#"{"data": [1,2]}"#);

        let tree = Arc::new(Tree::new());
        assert!(
            ingest_entry(load_entry(no_data, None), Vec::new(), tree.clone())
                .await
                .is_err()
        );
        assert!(
            ingest_entry(load_entry(bad_data, None), Vec::new(), tree.clone())
                .await
                .is_err()
        );
        assert!(tree.read().subtree("/users").is_err());
    }

    #[tokio::test]
    async fn rebuild_swaps_and_notifies_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.json", r#"{"data": {"k": "v1"}}"#);

        let tree = Arc::new(Tree::new());
        // Pre-existing junk must be gone after the rebuild swap.
        {
            let mut d = tree.write();
            *d.subtree_mut("/stale", true).unwrap() = Variant::Bool(true);
        }

        let cfg = SourcesConfig {
            list: vec![load_entry(path, None)],
            purge_every: None,
            directory: None,
        };
        let ing = Ingester::new(tree.clone(), cfg, Vec::new());
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = seen.clone();
        ing.add_listener(Box::new(move |data| {
            // The listener observes the new tree while it is read-locked.
            assert!(data.subtree("/k").is_ok());
            seen2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        assert!(ing.rebuild().await);
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
        let d = tree.read();
        assert!(d.subtree("/stale").is_err());
        let v = d.subtree("/k").unwrap();
        assert_eq!(v.as_str(&d.pool), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_old_tree() {
        let tree = Arc::new(Tree::new());
        {
            let mut d = tree.write();
            *d.subtree_mut("/keep", true).unwrap() = Variant::Int(1);
        }
        let cfg = SourcesConfig {
            list: vec![load_entry(std::path::PathBuf::from("/no/such/file"), None)],
            purge_every: None,
            directory: None,
        };
        let ing = Ingester::new(tree.clone(), cfg, Vec::new());
        assert!(!ing.rebuild().await);
        assert!(matches!(tree.read().subtree("/keep"), Ok(Variant::Int(1))));
    }

    #[tokio::test]
    async fn snapshots_round_trip_through_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(&dir, "a.json", r#"{"data": {"k": 7}}"#);
        let cache = tempfile::tempdir().unwrap();

        let cfg = SourcesConfig {
            list: vec![load_entry(src, None)],
            purge_every: None,
            directory: Some(cache.path().to_path_buf()),
        };
        let ing = Ingester::new(Arc::new(Tree::new()), cfg.clone(), Vec::new());
        assert!(ing.rebuild().await);
        assert!(cache.path().join(SNAPSHOT_FILE).exists());

        // A second ingester picks the snapshot up before any rebuild.
        let ing2 = Ingester::new(Arc::new(Tree::new()), cfg, Vec::new());
        ing2.load_snapshot().await;
        let d = ing2.tree().read();
        assert!(matches!(d.subtree("/k"), Ok(Variant::Uint(7))));
    }
}
