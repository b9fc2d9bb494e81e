use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

/// Wraps a watch event stream, restarting it when it fails.
pub struct Watch<T> {
    initialized: bool,
    span: tracing::Span,
    rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>) -> Watch<T> {
        Self {
            rx,
            initialized: false,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Indicates whether at least one event has been received.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receives the next event in the stream.
    ///
    /// If the stream fails, the error is logged and the watch sleeps for 1s
    /// before polling for a reset event. Returns `None` only if the underlying
    /// stream terminates.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            match self.rx.next().instrument(self.span.clone()).await? {
                Ok(ev) => {
                    self.initialized = true;
                    return Some(ev);
                }
                Err(error) => {
                    info!(parent: &self.span, %error, "Watch failed");
                    time::sleep(time::Duration::from_secs(1)).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }
}
