mod cache;
mod config;
mod http;
mod rng;

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use query::View;
use sources::{ExecFetcher, Ingester};
use tree::{Tree, Variant};

use crate::cache::CacheTable;
use crate::config::LoadedConfig;
use crate::http::AppState;

/// Serves transformed views of an ingested JSON tree.
#[derive(Debug, clap::Parser)]
#[command(name = "trellisd", version)]
struct Args {
    /// Path to the configuration document.
    #[arg(long, short, default_value = "trellis.json")]
    config: std::path::PathBuf,

    /// Serve immediately and build the initial tree in the background.
    #[arg(long)]
    build_async: bool,

    /// Log filter, e.g. "info,sources=debug". RUST_LOG works too.
    #[arg(long, env = "TRELLIS_LOG", default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log)),
        )
        .init();

    let loaded = LoadedConfig::load(&args.config)?;
    let threads = loaded.config.effective_listen_threads();
    tracing::info!(
        threads,
        listeners = loaded.config.listen.len(),
        "starting trellisd"
    );

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?
        .block_on(serve(args, loaded))
}

async fn serve(args: Args, loaded: LoadedConfig) -> anyhow::Result<()> {
    for l in &loaded.config.listen {
        anyhow::ensure!(
            !l.ssl,
            "listener {}:{} requests ssl, which this build does not terminate; \
             put a TLS proxy in front",
            l.host,
            l.port
        );
    }

    // Views compile up front; a bad view definition is a startup error.
    let mut views = BTreeMap::new();
    for (name, def) in loaded.view_defs() {
        let view = View::load(&loaded.pool, def)
            .map_err(|e| anyhow::anyhow!("view {name:?}: {e}"))?;
        tracing::info!(view = %name, "registered view");
        views.insert(name, view);
    }

    let tree = Arc::new(Tree::new());
    let env = loaded.env_pairs();

    attach_fetchers(&tree, &loaded, &env)?;

    let ingester = Ingester::new(tree.clone(), loaded.config.sources.clone(), env);
    ingester.startup_checks().await?;

    let state = Arc::new(AppState {
        tree: tree.clone(),
        views,
        cache: CacheTable::new(
            loaded.config.reply_cache.rows,
            loaded.config.reply_cache.columns,
        ),
        cache_ttl: loaded.config.reply_cache.maxtime,
        expose_debug: loaded.config.expose_debug_apis,
        config_echo: loaded.echo(),
        started: std::time::Instant::now(),
    });

    // Every rebuild invalidates cached replies while the tree is still
    // read-locked, so no request can cache a pre-rebuild body afterwards.
    {
        let state = state.clone();
        ingester.add_listener(Box::new(move |_| state.cache.clear()));
    }

    if args.build_async {
        let ing = ingester.clone();
        tokio::spawn(async move { ing.initial_build().await });
    } else {
        ingester.initial_build().await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(ingester.clone().run(shutdown_rx.clone()));

    let app = http::router(state);
    let mut servers = Vec::new();
    for l in &loaded.config.listen {
        let addr = resolve(&l.host, l.port)?;
        tracing::info!(%addr, "listening");
        let mut rx = shutdown_rx.clone();
        let server = axum::Server::try_bind(&addr)?
            .serve(app.clone().into_make_service())
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            });
        servers.push(tokio::spawn(server));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);

    for s in servers {
        match s.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "listener exited with an error"),
            Err(e) => tracing::error!(error = %e, "server task failed"),
        }
    }
    let _ = supervisor.await;
    Ok(())
}

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("listener {host}:{port} does not resolve"))
}

/// Install configured fetchers on their maps, creating the path if
/// needed. Fetch checks run before the server accepts traffic.
fn attach_fetchers(
    tree: &Arc<Tree>,
    loaded: &LoadedConfig,
    env: &[(String, String)],
) -> anyhow::Result<()> {
    for (path, spec) in &loaded.config.fetch {
        let fetcher = ExecFetcher::new(spec.exec.argv(), env.to_vec(), spec.every);
        if spec.check {
            fetcher
                .startup_check()
                .map_err(|e| anyhow::anyhow!("fetcher {path:?}: {e}"))?;
        }
        let mut guard = tree.write();
        let data = &mut *guard;
        let node = tree::subtree_mut(&mut data.pool, &mut data.root, path, true)
            .map_err(|e| anyhow::anyhow!("fetch path {path:?}: {e}"))?;
        let m = match node {
            Variant::Map(m) => &mut **m,
            other => other.make_map(&mut data.pool),
        };
        m.extra_mut().fetcher = Some(Arc::new(fetcher));
        tracing::info!(path = %path, "fetcher attached");
    }
    Ok(())
}
