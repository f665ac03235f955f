//! Pooled dense sets of 32-bit user ids.
//!
//! Workers churn through bitmaps on every transaction, so they are recycled
//! through a process-wide pool. `acquire_bm`/`release_bm` must stay balanced
//! on every path; the counters exist so tests can assert that.

use once_cell::sync::Lazy;
use roaring::RoaringBitmap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static POOL: Lazy<BitmapPool> = Lazy::new(BitmapPool::new);

struct BitmapPool {
    free: Mutex<Vec<RoaringBitmap>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BitmapPool {
    fn new() -> Self {
        BitmapPool {
            free: Mutex::new(Vec::new()),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }
}

/// Take an empty bitmap from the pool.
pub fn acquire_bm() -> RoaringBitmap {
    POOL.acquired.fetch_add(1, Ordering::Relaxed);
    POOL.free
        .lock()
        .unwrap()
        .pop()
        .unwrap_or_else(RoaringBitmap::new)
}

/// Return a bitmap to the pool.
pub fn release_bm(mut bm: RoaringBitmap) {
    POOL.released.fetch_add(1, Ordering::Relaxed);
    bm.clear();
    POOL.free.lock().unwrap().push(bm);
}

/// Number of acquired bitmaps not yet released.
pub fn outstanding_bm() -> u64 {
    POOL.acquired.load(Ordering::Relaxed) - POOL.released.load(Ordering::Relaxed)
}

/// Bitmap of the given ids.
pub fn bm_of(ids: &[u32]) -> RoaringBitmap {
    ids.iter().copied().collect()
}

/// Serialize with the portable roaring format. Stable across runs.
pub fn marshal_bm(bm: &RoaringBitmap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bm.serialized_size());
    bm.serialize_into(&mut buf)
        .expect("BUG: serialize bitmap to vec failed");
    buf
}

/// Parse serialized bitmap bytes. Empty input is an empty bitmap.
pub fn parse_bm(value: &[u8]) -> std::io::Result<RoaringBitmap> {
    if value.is_empty() {
        return Ok(RoaringBitmap::new());
    }
    RoaringBitmap::deserialize_from(value)
}

/// Parse bitmap bytes that came from our own storage. Corruption here is a
/// programmer error, not an input error.
pub fn must_parse_bm(value: &[u8]) -> RoaringBitmap {
    parse_bm(value).expect("BUG: corrupt persisted bitmap")
}

/// Assert the pool drained back to `before`. Other tests share the pool, so
/// give their in-flight bitmaps a moment to come back.
#[cfg(test)]
pub(crate) fn assert_pool_balanced(before: u64) {
    for _ in 0..200 {
        if outstanding_bm() == before {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!(
        "bitmap pool leak: outstanding {} != {}",
        outstanding_bm(),
        before
    );
}
