use strategy_controller_core::{FanoutMode, SubscribeTarget};
use tokio::time;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("no connections subscribe to {0}")]
    NoConnectionsForKind(SubscribeTarget),

    #[error("timed out sending to {0}")]
    Timeout(String),

    #[error("stream to {0} is closed")]
    Closed(String),
}

/// Controls how pushes are delivered to connections.
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// The number of times a timed-out send is attempted before giving up.
    pub max_attempts: usize,

    /// How long a single send may wait for stream capacity.
    pub timeout: time::Duration,

    pub fanout: FanoutMode,
}

// === impl PushError ===

impl PushError {
    pub fn is_no_connections(&self) -> bool {
        matches!(self, Self::NoConnectionsForKind(_))
    }
}

// === impl PushConfig ===

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: time::Duration::from_secs(3),
            fanout: FanoutMode::default(),
        }
    }
}

/// Applies the fan-out policy to the results of sending to each of a set of
/// connections in turn.
///
/// `send` is called for each connection in order. With
/// [`FanoutMode::FailFast`] the first failure stops the fan-out; with
/// [`FanoutMode::BestEffort`] every connection is attempted and the first
/// failure is returned.
pub(crate) async fn fan_out<C, F, Fut>(
    mode: FanoutMode,
    connections: Vec<C>,
    mut send: F,
) -> Result<(), PushError>
where
    F: FnMut(C) -> Fut,
    Fut: std::future::Future<Output = Result<(), PushError>>,
{
    let mut first_error = None;
    for conn in connections {
        if let Err(error) = send(conn).await {
            match mode {
                FanoutMode::FailFast => return Err(error),
                FanoutMode::BestEffort => {
                    first_error.get_or_insert(error);
                }
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}
