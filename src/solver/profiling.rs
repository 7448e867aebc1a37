//! Per-run metrics collector.
//!
//! One `ProfilingStats` lives inside each data base; every phase records into
//! it through a shared reference, so timings never outlive the run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfileCategory {
    Upload,
    Download,
    Sync,
    Dispatch,
    Allocation,
    Assembly,
    Solve,
}

impl ProfileCategory {
    pub const ALL: [ProfileCategory; 7] = [
        ProfileCategory::Upload,
        ProfileCategory::Download,
        ProfileCategory::Sync,
        ProfileCategory::Dispatch,
        ProfileCategory::Allocation,
        ProfileCategory::Assembly,
        ProfileCategory::Solve,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProfileCategory::Upload => "Host -> Device Transfer",
            ProfileCategory::Download => "Device -> Host Transfer",
            ProfileCategory::Sync => "Stream Sync Wait",
            ProfileCategory::Dispatch => "Kernel Dispatch",
            ProfileCategory::Allocation => "Device Allocation",
            ProfileCategory::Assembly => "Equation Assembly",
            ProfileCategory::Solve => "Linear Solve",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CategoryStats {
    pub total_time: Duration,
    pub call_count: u64,
    pub min_time: Duration,
    pub max_time: Duration,
    pub total_bytes: u64,
}

impl CategoryStats {
    fn add(&mut self, duration: Duration, bytes: u64) {
        if self.call_count == 0 || duration < self.min_time {
            self.min_time = duration;
        }
        self.max_time = self.max_time.max(duration);
        self.total_time += duration;
        self.total_bytes += bytes;
        self.call_count += 1;
    }

    pub fn avg_time(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            self.total_time / self.call_count as u32
        }
    }

    pub fn throughput_mb_per_sec(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.total_bytes as f64 / (1024.0 * 1024.0) / secs
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub alloc_bytes: u64,
    pub alloc_count: u64,
    pub free_bytes: u64,
    pub free_count: u64,
    pub max_alloc_request: u64,
}

impl MemoryStats {
    pub fn net_bytes(&self) -> i64 {
        self.alloc_bytes as i64 - self.free_bytes as i64
    }
}

#[derive(Debug, Default)]
struct Inner {
    categories: HashMap<ProfileCategory, CategoryStats>,
    locations: HashMap<String, (ProfileCategory, CategoryStats)>,
    device_memory: MemoryStats,
}

#[derive(Debug, Default)]
pub struct ProfilingStats {
    inner: Mutex<Inner>,
}

impl ProfilingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }

    pub fn record(&self, category: ProfileCategory, duration: Duration, bytes: u64) {
        self.inner
            .lock()
            .categories
            .entry(category)
            .or_default()
            .add(duration, bytes);
    }

    pub fn record_location(
        &self,
        location: &str,
        category: ProfileCategory,
        duration: Duration,
        bytes: u64,
    ) {
        let mut inner = self.inner.lock();
        inner
            .categories
            .entry(category)
            .or_default()
            .add(duration, bytes);
        inner
            .locations
            .entry(location.to_string())
            .or_insert_with(|| (category, CategoryStats::default()))
            .1
            .add(duration, bytes);
    }

    pub fn record_device_alloc(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        let mem = &mut inner.device_memory;
        mem.alloc_bytes += bytes;
        mem.alloc_count += 1;
        mem.max_alloc_request = mem.max_alloc_request.max(bytes);
    }

    pub fn record_device_free(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.device_memory.free_bytes += bytes;
        inner.device_memory.free_count += 1;
    }

    pub fn get_stats(&self, category: ProfileCategory) -> CategoryStats {
        self.inner
            .lock()
            .categories
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_location_stats(&self, location: &str) -> Option<CategoryStats> {
        self.inner
            .lock()
            .locations
            .get(location)
            .map(|(_, stats)| stats.clone())
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        self.inner.lock().device_memory.clone()
    }

    /// Location rows sorted by total time, slowest first.
    pub fn summary(&self) -> Vec<(String, ProfileCategory, CategoryStats)> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .locations
            .iter()
            .map(|(loc, (cat, stats))| (loc.clone(), *cat, stats.clone()))
            .collect();
        rows.sort_by(|a, b| b.2.total_time.cmp(&a.2.total_time).then(a.0.cmp(&b.0)));
        rows
    }

    pub fn print_report(&self) {
        for category in ProfileCategory::ALL {
            let stats = self.get_stats(category);
            if stats.call_count == 0 {
                continue;
            }
            log::info!(
                "{:<24} calls {:>6}  total {:>10.3} ms  avg {:>8.3} ms  {:>8.1} MB/s",
                category.name(),
                stats.call_count,
                stats.total_time.as_secs_f64() * 1e3,
                stats.avg_time().as_secs_f64() * 1e3,
                stats.throughput_mb_per_sec()
            );
        }
        for (location, _, stats) in self.summary() {
            log::debug!(
                "  {:<40} {:>6} calls {:>10.3} ms",
                location,
                stats.call_count,
                stats.total_time.as_secs_f64() * 1e3
            );
        }
        let mem = self.get_memory_stats();
        log::info!(
            "device memory: {} allocations, {:.2} MB live",
            mem.alloc_count,
            mem.net_bytes() as f64 / (1024.0 * 1024.0)
        );
    }
}

/// Records the elapsed time of a scope when dropped.
pub struct ProfileTimer<'a> {
    stats: &'a ProfilingStats,
    category: ProfileCategory,
    location: &'a str,
    bytes: u64,
    start: Instant,
}

impl<'a> ProfileTimer<'a> {
    pub fn new(stats: &'a ProfilingStats, category: ProfileCategory, location: &'a str) -> Self {
        Self {
            stats,
            category,
            location,
            bytes: 0,
            start: Instant::now(),
        }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }
}

impl Drop for ProfileTimer<'_> {
    fn drop(&mut self) {
        self.stats
            .record_location(self.location, self.category, self.start.elapsed(), self.bytes);
    }
}
