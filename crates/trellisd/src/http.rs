//! The HTTP surface over the core: JSON-pointer reads, view evaluation
//! with reply caching, and the optional debug endpoints.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use query::View;
use tree::{now_ms, StringPool, Tree, Variant};

use crate::cache::{CacheTable, Format, Request, StoredReply};

pub struct AppState {
    pub tree: Arc<Tree>,
    pub views: BTreeMap<String, View>,
    pub cache: CacheTable,
    pub cache_ttl: Option<Duration>,
    pub expose_debug: bool,
    pub config_echo: serde_json::Value,
    pub started: std::time::Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut r = Router::new()
        .route("/get", get(get_subtree_root))
        .route("/get/*path", get(get_subtree))
        .route("/view/:name", get(run_view))
        .route("/view/:name/*rest", get(run_view_with_rest));
    if state.expose_debug {
        r = r
            .route("/info", get(info))
            .route("/config", get(config_echo))
            .route("/debug/views", get(debug_views))
            .route("/testview", get(testview));
    }
    r.with_state(state)
}

#[derive(Clone, Copy)]
struct OutputOpts {
    format: Format,
    pretty: bool,
    nofetch: bool,
}

fn parse_opts(params: &HashMap<String, String>) -> OutputOpts {
    let truthy = |k: &str| {
        matches!(
            params.get(k).map(String::as_str),
            Some("1" | "true" | "yes")
        )
    };
    let format = match params.get("fmt").map(String::as_str) {
        Some("bj") => Format::Bj,
        _ => Format::Json,
    };
    OutputOpts {
        format,
        pretty: truthy("pretty"),
        nofetch: truthy("nofetch"),
    }
}

/// Serialize a variant in the requested format, returning the content
/// type and body bytes (shared between the response and the reply cache).
fn serialize(
    pool: &StringPool,
    v: &Variant,
    opts: OutputOpts,
) -> Result<(&'static str, Bytes), Response> {
    match opts.format {
        Format::Json => {
            let mut buf = Vec::new();
            tree::json::write(&mut buf, pool, v, opts.pretty)
                .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
            Ok(("application/json", Bytes::from(buf)))
        }
        Format::Bj => {
            let mut buf = Vec::new();
            bj::encode(&mut buf, pool, v)
                .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
            Ok(("application/octet-stream", Bytes::from(buf)))
        }
    }
}

fn body_response(content_type: &'static str, body: Bytes) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

fn error_response(code: StatusCode, msg: &str) -> Response {
    (code, msg.to_string()).into_response()
}

async fn get_subtree_root(
    state: State<Arc<AppState>>,
    params: Query<HashMap<String, String>>,
) -> Response {
    subtree_response(&state, "", &params)
}

async fn get_subtree(
    state: State<Arc<AppState>>,
    Path(path): Path<String>,
    params: Query<HashMap<String, String>>,
) -> Response {
    subtree_response(&state, &path, &params)
}

fn subtree_response(
    state: &AppState,
    rel_path: &str,
    params: &HashMap<String, String>,
) -> Response {
    let opts = parse_opts(params);
    let path = if rel_path.is_empty() {
        String::new()
    } else {
        format!("/{rel_path}")
    };

    if !opts.nofetch && !path.is_empty() {
        // Best effort: a miss with no fetcher attached simply 404s below.
        let _ = state.tree.get_or_fetch(&path);
    }

    let data = state.tree.read();
    match data.subtree(&path) {
        Ok(node) => match serialize(&data.pool, node, opts) {
            Ok((ct, body)) => body_response(ct, body),
            Err(e) => e,
        },
        Err(tree::Error::NoSuchNode) => error_response(StatusCode::NOT_FOUND, "no such node"),
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn run_view(
    state: State<Arc<AppState>>,
    Path(name): Path<String>,
    raw: RawQuery,
    headers: HeaderMap,
    params: Query<HashMap<String, String>>,
) -> Response {
    view_response(&state, &name, "", raw.0.as_deref(), &headers, &params)
}

async fn run_view_with_rest(
    state: State<Arc<AppState>>,
    Path((name, rest)): Path<(String, String)>,
    raw: RawQuery,
    headers: HeaderMap,
    params: Query<HashMap<String, String>>,
) -> Response {
    view_response(&state, &name, &rest, raw.0.as_deref(), &headers, &params)
}

fn view_response(
    state: &AppState,
    name: &str,
    rest: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Response {
    let opts = parse_opts(params);
    let Some(view) = state.views.get(name) else {
        return error_response(StatusCode::NOT_FOUND, "no such view");
    };

    let fingerprint = Request {
        query: format!("/view/{name}/{rest}?{}", raw_query.unwrap_or_default()),
        method: "GET".to_string(),
        format: opts.format,
        pretty: opts.pretty,
        compression: String::new(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    };
    if let Some(hit) = state.cache.get(&fingerprint, now_ms()) {
        return ([(header::CONTENT_TYPE, hit.content_type)], hit.body.clone()).into_response();
    }

    // Request parameters become VM variables. Values parse leniently so
    // `?room=2` is a number and `?room="2"` a string; unparseable text
    // stays a string.
    let mut vars_pool = StringPool::new();
    let mut vars_map = tree::VMap::new();
    for (k, v) in params.iter() {
        if matches!(k.as_str(), "pretty" | "fmt" | "nofetch") {
            continue;
        }
        let parsed = tree::json::parse(&mut vars_pool, v.as_bytes())
            .unwrap_or_else(|_| Variant::str(&mut vars_pool, v.as_bytes()));
        let slot = vars_map.put_key(&mut vars_pool, k.as_bytes());
        *slot = parsed;
    }
    if !rest.is_empty() {
        let v = Variant::str(&mut vars_pool, rest.as_bytes());
        *vars_map.put_key(&mut vars_pool, b"path") = v;
    }
    let mut vars = Variant::Map(Box::new(vars_map));

    let mut out_pool = StringPool::new();
    let produced = {
        let data = state.tree.read();
        view.produce(&data.pool, &data.root, &vars_pool, Some(&vars), &mut out_pool)
    };
    vars.clear(&mut vars_pool);

    let mut out = match produced {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(view = %name, error = %e, "view evaluation failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };
    let serialized = serialize(&out_pool, &out, opts);
    out.clear(&mut out_pool);

    match serialized {
        Ok((content_type, body)) => {
            // Cache the serialized form; the bytes are shared with this
            // response, so the insert is one refcount bump.
            if state.cache.enabled() {
                let expiry = state
                    .cache_ttl
                    .map(|d| now_ms().saturating_add(d.as_millis() as u64))
                    .unwrap_or(0);
                state.cache.put(
                    fingerprint,
                    Arc::new(StoredReply {
                        expiry_ms: expiry,
                        content_type,
                        body: body.clone(),
                    }),
                );
            }
            body_response(content_type, body)
        }
        Err(e) => e,
    }
}

async fn info(state: State<Arc<AppState>>) -> Response {
    let (strings, root_kind) = {
        let data = state.tree.read();
        (data.pool.len(), data.root.type_str())
    };
    let body = serde_json::json!({
        "uptime_s": state.started.elapsed().as_secs(),
        "views": state.views.keys().collect::<Vec<_>>(),
        "tree": {"root": root_kind, "pooled_strings": strings},
        "reply_cache": state.cache.enabled(),
    });
    axum::Json(body).into_response()
}

async fn config_echo(state: State<Arc<AppState>>) -> Response {
    axum::Json(state.config_echo.clone()).into_response()
}

async fn debug_views(state: State<Arc<AppState>>) -> Response {
    let mut out = String::new();
    for (name, view) in &state.views {
        out.push_str(&format!("=== view {name} ===\n"));
        for ep in view.entry_points() {
            out.push_str(&format!("entry point [{}] = {}\n", ep.name, ep.idx));
        }
        for line in view.executable().disasm() {
            out.push_str(&line);
            out.push('\n');
        }
        out.push('\n');
    }
    out.into_response()
}

/// Ad-hoc query runner: parse, disassemble, execute against the live
/// tree.
async fn testview(
    state: State<Arc<AppState>>,
    params: Query<HashMap<String, String>>,
) -> Response {
    let Some(q) = params.get("q") else {
        return error_response(StatusCode::BAD_REQUEST, "missing ?q=");
    };

    let mut exe = query::Executable::new();
    let start = match query::parse(&mut exe, q) {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let mut out = String::from("--- disasm ---\n");
    for line in exe.disasm() {
        out.push_str(&line);
        out.push('\n');
    }

    let arena = query::Bump::new();
    let data = state.tree.read();
    let mut vm = query::Vm::new(&exe, &[], &arena, &data.pool);
    match vm.run(&data.root, start) {
        Ok(()) => {
            let mut rpool = StringPool::new();
            let results = vm.results().to_vec();
            out.push_str(&format!("--- results: {} ---\n", results.len()));
            for e in results {
                let key = vm.key_str(&e).unwrap_or("(no key name)").to_string();
                let mut v = vm.clone_entry_into(e, &mut rpool);
                out.push_str(&format!(
                    "<{key}>\n{}\n",
                    tree::json::to_string(&rpool, &v, true)
                ));
                v.clear(&mut rpool);
            }
            out.into_response()
        }
        Err(e) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{out}\nvm error: {e}"))
        }
    }
}
