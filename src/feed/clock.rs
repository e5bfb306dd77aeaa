use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock time that advances with tokio's clock.
///
/// The wall time is sampled once; afterwards `now` adds the elapsed
/// `tokio::time::Instant`, so paused test runtimes move replay time too.
#[derive(Debug, Clone, Copy)]
pub struct ReplayClock {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl ReplayClock {
    pub fn start() -> Self {
        Self::anchored(Utc::now())
    }

    pub fn anchored(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            instant: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.instant.elapsed()).unwrap_or(chrono::Duration::zero());
        self.wall + elapsed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let wall = Utc::now();
        let clock = ReplayClock::anchored(wall);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now() - wall, chrono::Duration::seconds(5));
    }
}
