use std::{net::SocketAddr, time::Duration};

use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::FaultKind;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Received,
    ResponseSent,
    Faulted(FaultKind),
}

/// One observable step in the life of a request.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub kind: EventKind,
    pub method: Method,
    pub path: String,
    pub remote_addr: Option<SocketAddr>,
    pub handler: Option<String>,
    pub status: Option<StatusCode>,
    /// Fault detail, kept out of error responses but logged.
    pub error: Option<String>,
    pub elapsed: Duration,
    pub at: DateTime<Utc>,
}

impl DispatchEvent {
    pub fn new(kind: EventKind, method: Method, path: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            path: path.into(),
            remote_addr: None,
            handler: None,
            status: None,
            error: None,
            elapsed: Duration::ZERO,
            at: Utc::now(),
        }
    }
}

/// Receives dispatch events alongside the log output, e.g. to feed metrics.
pub trait DispatchObserver: Send + Sync {
    fn on_event(&self, event: &DispatchEvent);
}

/// Writes `event` to the tracing subscriber.
pub fn log_event(event: &DispatchEvent) {
    let remote = event
        .remote_addr
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let handler = event.handler.as_deref().unwrap_or_default();
    let status = event.status.map(|status| status.as_u16()).unwrap_or_default();
    let error = event.error.as_deref().unwrap_or_default();
    let duration_ms = event.elapsed.as_millis();

    match event.kind {
        EventKind::Received => debug!(
            method = %event.method,
            path = %event.path,
            remote = %remote,
            "request received"
        ),
        EventKind::ResponseSent => info!(
            method = %event.method,
            path = %event.path,
            remote = %remote,
            handler,
            status,
            duration_ms,
            "request summary"
        ),
        EventKind::Faulted(kind @ (FaultKind::Binding | FaultKind::Cancelled)) => warn!(
            method = %event.method,
            path = %event.path,
            handler,
            fault = %kind,
            status,
            error,
            "request rejected"
        ),
        EventKind::Faulted(kind) => error!(
            method = %event.method,
            path = %event.path,
            handler,
            fault = %kind,
            status,
            error,
            duration_ms,
            "request failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventKind>>);

    impl DispatchObserver for Recorder {
        fn on_event(&self, event: &DispatchEvent) {
            self.0.lock().expect("recorder lock").push(event.kind);
        }
    }

    #[test]
    fn observer_receives_events_in_order() {
        let recorder = Recorder::default();
        let observer: &dyn DispatchObserver = &recorder;

        let received = DispatchEvent::new(EventKind::Received, Method::GET, "/foo");
        let mut sent = received.clone();
        sent.kind = EventKind::ResponseSent;
        sent.status = Some(StatusCode::OK);

        for event in [&received, &sent] {
            log_event(event);
            observer.on_event(event);
        }

        let kinds = recorder.0.lock().expect("recorder lock").clone();
        assert_eq!(kinds, vec![EventKind::Received, EventKind::ResponseSent]);
        assert!(sent.at >= received.at);
    }
}
