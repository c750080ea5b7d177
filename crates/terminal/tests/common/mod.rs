//! Common test utilities
#![allow(dead_code)]

use std::{
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use portier_terminal::{
    AccessEngine, CardHandle, RecordingIndicator,
    emulator::{VirtualCard, VirtualPki},
};
use tracing::Level;

/// Engine trusting `pki` that blinks without pausing
pub fn engine(pki: &VirtualPki, indicator: &RecordingIndicator) -> AccessEngine {
    AccessEngine::new(pki.anchor(), indicator.clone()).with_blink_interval(Duration::ZERO)
}

/// Open a session straight onto `card`
pub fn open(card: &VirtualCard) -> CardHandle {
    open_with_timeout(card, Duration::from_secs(2))
}

/// Open a session with a specific exchange timeout
pub fn open_with_timeout(card: &VirtualCard, timeout: Duration) -> CardHandle {
    CardHandle::open("virtual", card.transport(), timeout).unwrap()
}

/// Whether `needle` occurs anywhere in `haystack`
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` and return its result along with everything it logged
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_writer(move || writer.clone())
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
    (result, logs)
}

/// Poll `condition` until it holds, panicking after `timeout`
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        thread::sleep(Duration::from_millis(2));
    }
}
