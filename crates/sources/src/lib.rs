//! Periodic ingestion of external trees.
//!
//! Configured sources (files or subprocesses) are pulled on their own
//! schedules and merged into the shared [`tree::Tree`]; a purge interval
//! rebuilds the whole tree from scratch and swaps it in under one write
//! lock. Listeners registered on the ingester observe every rebuild while
//! the tree is still read-locked, so derived caches update atomically.

pub mod config;
mod fetcher;
mod ingest;

pub use config::{parse_duration, ArgList, SourceEntry, SourcesConfig};
pub use fetcher::ExecFetcher;
pub use ingest::Ingester;

use tree::{StringPool, Variant};

/// Parse an ingested payload, autodetecting BJ against lenient JSON by
/// the four-byte magic.
pub fn parse_payload(bytes: &[u8]) -> anyhow::Result<(StringPool, Variant)> {
    let mut pool = StringPool::new();
    if bj::is_bj(bytes) {
        let v = bj::decode(&mut pool, bytes, &bj::Limits::default())?;
        Ok((pool, v))
    } else {
        let v = tree::json::parse(&mut pool, bytes)?;
        Ok((pool, v))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_format_autodetection() {
        let (pool, mut v) = parse_payload(br#"{"data": {"k": 1}}"#).unwrap();
        assert!(v.map().is_some());
        let mut p = pool;
        v.clear(&mut p);

        let mut src_pool = StringPool::new();
        let mut src = tree::json::parse(&mut src_pool, br#"{"data": {"k": 1}}"#).unwrap();
        let mut buf = Vec::new();
        bj::encode(&mut buf, &src_pool, &src).unwrap();
        src.clear(&mut src_pool);

        let (dpool, out) = parse_payload(&buf).unwrap();
        assert!(out.map().is_some());
        assert_eq!(
            tree::json::to_string(&dpool, &out, false),
            r#"{"data":{"k":1}}"#
        );
    }

    #[test]
    fn garbage_payload_is_an_error_not_a_panic() {
        assert!(parse_payload(b"\xff\xfe\x00 not json").is_err());
        assert!(parse_payload(b"").is_err());
    }
}
