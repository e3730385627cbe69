use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Counts warnings whose message contains a needle.
#[derive(Clone)]
pub struct WarningCounter {
    needle: &'static str,
    count: Arc<AtomicUsize>,
}

impl WarningCounter {
    pub fn new(needle: &'static str) -> Self {
        Self {
            needle,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        if message.0.contains(self.needle) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}
