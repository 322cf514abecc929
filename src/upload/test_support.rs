use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wiremock::{Request, Respond, ResponseTemplate};

/// Mock responder that holds every request for `hold` and records, on the
/// server side, how many requests were being served at once.
///
/// A request still counts as open until `hold` has passed since it arrived.
#[derive(Clone)]
pub struct OverlapCounter {
    hold: Duration,
    open: Arc<Mutex<Vec<Instant>>>,
    peak: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl OverlapCounter {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            open: Arc::new(Mutex::new(Vec::new())),
            peak: Arc::new(AtomicUsize::new(0)),
            total: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak(&self) -> usize { self.peak.load(Ordering::SeqCst) }

    pub fn total(&self) -> usize { self.total.load(Ordering::SeqCst) }
}

impl Respond for OverlapCounter {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let now = Instant::now();
        let mut open = self.open.lock().unwrap();
        open.retain(|arrived| now.duration_since(*arrived) < self.hold);
        open.push(now);
        self.peak.fetch_max(open.len(), Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_delay(self.hold)
    }
}
