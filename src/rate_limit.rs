//! Request rate limits for the recognition service, written as `600/m`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period a [`RateLimit`] is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
    Hour,
}

impl RateLimitPeriod {
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(3600),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
            RateLimitPeriod::Hour => write!(f, "h"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            "h" => Ok(RateLimitPeriod::Hour),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// At most `max_requests` requests per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Time between requests once the initial burst is used up.
    fn refill_interval(&self) -> Duration {
        self.per_period.to_duration() / self.max_requests as u32
    }

    /// Create a [`RateLimiter`] for this rate limit.
    ///
    /// The bucket starts with enough tokens for one `concurrency`-sized burst,
    /// then refills one token at a time, so a long job is spread evenly over
    /// each period instead of stalling at the end of it.
    pub fn to_rate_limiter(&self, concurrency: usize) -> RateLimiter {
        let burst = concurrency.clamp(1, self.max_requests);
        RateLimiter::builder()
            .initial(burst)
            .refill(1)
            .max(burst)
            .interval(self.refill_interval())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("Expected <requests>/<s|m|h>"))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 || max_requests > u32::MAX as usize {
                bail!("Request count must be between 1 and {}", u32::MAX);
            }
            Ok(Self {
                max_requests,
                per_period: per_period.trim().parse()?,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
