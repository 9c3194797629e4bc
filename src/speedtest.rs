//! Link throughput measurement for *SPEED.
//!
//! The ROM sends data parcels that the server echoes back; both directions
//! therefore contribute to the byte count. The report is fetched at the end
//! through the string output buffer.

use std::time::Instant;

/// State of one speed test run.
#[derive(Debug)]
pub struct SpeedTest {
    started: Instant,
    parcels: u64,
    bytes: u64,
}

impl SpeedTest {
    pub fn new() -> Self {
        Self { started: Instant::now(), parcels: 0, bytes: 0 }
    }

    /// Accounts one echoed parcel: `len` bytes each way.
    pub fn note_parcel(&mut self, len: usize) {
        self.parcels += 1;
        self.bytes += 2 * len as u64;
    }

    pub fn report(&self) -> String {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { self.bytes as f64 / elapsed } else { 0.0 };
        format!(
            "{} bytes in {} parcels over {:.1} seconds: {:.0} bytes/sec",
            self.bytes, self.parcels, elapsed, rate,
        )
    }
}

impl Default for SpeedTest {
    fn default() -> Self {
        Self::new()
    }
}
