use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LENGTH: usize = 26;
const TIME_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Request,
}

impl Prefix {
    fn as_str(&self) -> &'static str {
        match self {
            Prefix::Request => "req",
        }
    }
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);
static COUNTER: Mutex<u32> = Mutex::new(0);

fn random_base62(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| BASE62_CHARS[rng.gen_range(0..62)] as char)
        .collect()
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Create a sortable identifier: `<prefix>_<16 hex chars of time+counter><random>`.
pub fn create(prefix: Prefix, timestamp: Option<u64>) -> String {
    let current = timestamp.unwrap_or_else(now_millis);

    let counter_val = {
        let mut counter = COUNTER.lock();
        if LAST_TIMESTAMP.swap(current, Ordering::Relaxed) != current {
            *counter = 0;
        }
        *counter += 1;
        *counter
    };
    let packed = current.wrapping_mul(0x1000) + u64::from(counter_val);

    format!(
        "{}_{}{}",
        prefix.as_str(),
        hex::encode(packed.to_be_bytes()),
        random_base62(LENGTH - TIME_HEX_LEN)
    )
}

pub fn request_id() -> String {
    create(Prefix::Request, None)
}
