use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Security and catalog counters for monitoring
#[derive(Clone)]
pub struct Metrics {
    pub logins_succeeded: Arc<AtomicU64>,
    pub logins_failed: Arc<AtomicU64>,
    pub signups: Arc<AtomicU64>,
    pub rate_limited: Arc<AtomicU64>,
    pub csrf_rejected: Arc<AtomicU64>,
    pub sessions_idle_expired: Arc<AtomicU64>,
    pub vehicles_written: Arc<AtomicU64>,
    pub images_uploaded: Arc<AtomicU64>,
    pub inquiries_received: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            logins_succeeded: Arc::new(AtomicU64::new(0)),
            logins_failed: Arc::new(AtomicU64::new(0)),
            signups: Arc::new(AtomicU64::new(0)),
            rate_limited: Arc::new(AtomicU64::new(0)),
            csrf_rejected: Arc::new(AtomicU64::new(0)),
            sessions_idle_expired: Arc::new(AtomicU64::new(0)),
            vehicles_written: Arc::new(AtomicU64::new(0)),
            images_uploaded: Arc::new(AtomicU64::new(0)),
            inquiries_received: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn inc_logins_succeeded(&self) {
        self.logins_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_logins_failed(&self) {
        self.logins_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signups(&self) {
        self.signups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_csrf_rejected(&self) {
        self.csrf_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_idle_expired(&self) {
        self.sessions_idle_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vehicles_written(&self) {
        self.vehicles_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_images_uploaded(&self) {
        self.images_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_inquiries_received(&self) {
        self.inquiries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            logins_succeeded: self.logins_succeeded.load(Ordering::Relaxed),
            logins_failed: self.logins_failed.load(Ordering::Relaxed),
            signups: self.signups.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            csrf_rejected: self.csrf_rejected.load(Ordering::Relaxed),
            sessions_idle_expired: self.sessions_idle_expired.load(Ordering::Relaxed),
            vehicles_written: self.vehicles_written.load(Ordering::Relaxed),
            images_uploaded: self.images_uploaded.load(Ordering::Relaxed),
            inquiries_received: self.inquiries_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub logins_succeeded: u64,
    pub logins_failed: u64,
    pub signups: u64,
    pub rate_limited: u64,
    pub csrf_rejected: u64,
    pub sessions_idle_expired: u64,
    pub vehicles_written: u64,
    pub images_uploaded: u64,
    pub inquiries_received: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 9] = [
            ("logins_succeeded", "Successful back-office logins", self.logins_succeeded),
            ("logins_failed", "Failed login attempts", self.logins_failed),
            ("signups", "Accounts created", self.signups),
            ("rate_limited", "Requests rejected by a rate limiter", self.rate_limited),
            ("csrf_rejected", "Requests rejected by CSRF validation", self.csrf_rejected),
            ("sessions_idle_expired", "Sessions revoked after inactivity", self.sessions_idle_expired),
            ("vehicles_written", "Vehicle create/update/delete operations", self.vehicles_written),
            ("images_uploaded", "Vehicle images uploaded", self.images_uploaded),
            ("inquiries_received", "Customer inquiries received", self.inquiries_received),
        ];
        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP mikki_{name} {help}\n# TYPE mikki_{name} counter\nmikki_{name} {value}\n"
            ));
        }
        out.push_str(&format!(
            "# HELP mikki_uptime_seconds Uptime seconds\n# TYPE mikki_uptime_seconds gauge\nmikki_uptime_seconds {}\n",
            self.uptime_seconds
        ));
        out
    }
}
