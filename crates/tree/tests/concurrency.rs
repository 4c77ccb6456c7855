//! Readers hold the shared lock for a whole evaluation and therefore see
//! one consistent tree generation, never a half-merged state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tree::{MergeFlags, StringPool, Tree, Variant};

fn generation_doc(pool: &mut StringPool, generation: u64, width: usize) -> Variant {
    let mut root = Variant::new_map();
    {
        let m = root.map_mut().expect("fresh map");
        for i in 0..width {
            let slot = m.put_key(pool, format!("k{i}").as_bytes());
            *slot = Variant::Uint(generation);
        }
    }
    root
}

#[test]
fn readers_observe_a_single_generation() {
    const WIDTH: usize = 64;
    const GENERATIONS: u64 = 200;

    let tree = Arc::new(Tree::new());
    {
        let mut sp = StringPool::new();
        let mut doc = generation_doc(&mut sp, 0, WIDTH);
        tree.write().merge(&sp, &doc, MergeFlags::FLAT).unwrap();
        doc.clear(&mut sp);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let tree = tree.clone();
        let stop = stop.clone();
        readers.push(std::thread::spawn(move || {
            let mut observed = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let data = tree.read();
                let m = data.root.map().expect("root stays a map");
                let mut gen_seen = None;
                for i in 0..WIDTH {
                    let h = data
                        .pool
                        .lookup(format!("k{i}").as_bytes())
                        .expect("key interned");
                    let Some(Variant::Uint(g)) = m.get(h) else {
                        panic!("key k{i} missing or wrong kind");
                    };
                    match gen_seen {
                        None => gen_seen = Some(*g),
                        // The write lock covers the whole merge, so a
                        // torn generation is a lock bug.
                        Some(prev) => assert_eq!(prev, *g, "torn read"),
                    }
                }
                observed += 1;
            }
            observed
        }));
    }

    for generation in 1..=GENERATIONS {
        let mut sp = StringPool::new();
        let mut doc = generation_doc(&mut sp, generation, WIDTH);
        tree.write().merge(&sp, &doc, MergeFlags::FLAT).unwrap();
        doc.clear(&mut sp);
    }

    stop.store(true, Ordering::Relaxed);
    for r in readers {
        let observed = r.join().expect("reader panicked");
        assert!(observed > 0, "reader never got the lock");
    }
}
