use std::{fmt, str::FromStr};

/// Determines how a push that fans out to many connections handles a failure
/// on one of them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FanoutMode {
    /// Stop at the first failed connection; connections after it in the same
    /// push are not sent to.
    #[default]
    FailFast,

    /// Send to every connection and report the first failure.
    BestEffort,
}

impl FromStr for FanoutMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" => Ok(Self::FailFast),
            "best-effort" => Ok(Self::BestEffort),
            s => anyhow::bail!("invalid fanout mode: {s}"),
        }
    }
}

impl fmt::Display for FanoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => "fail-fast".fmt(f),
            Self::BestEffort => "best-effort".fmt(f),
        }
    }
}
