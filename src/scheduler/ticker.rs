//! Clock signal sources driving the per-feed update loops.
//!
//! Both variants run a background task feeding a channel, so a slow consumer
//! delays ticks instead of piling them up, and both stop synchronously:
//! after `stop()` returns no further tick can be observed.

use std::time::Duration;

use chrono::{DateTime, Days, Duration as ChronoDuration, LocalResult, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Ticker {
    ticks: mpsc::Receiver<()>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Ticks every `period`. The first tick fires after a uniformly random
    /// delay in `[0, period)`, so tickers created together don't all hit
    /// their feeds at the same instant.
    pub fn periodic(period: Duration) -> Ticker {
        let (tx, ticks) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut wait = period.mul_f64(rand::thread_rng().gen::<f64>());
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                if tx.send(()).await.is_err() {
                    return;
                }
                wait = period;
            }
        });
        Ticker { ticks, cancel, task }
    }

    /// Ticks once per day at the given wall-clock time in `timezone`.
    pub fn daily(hour: u32, minute: u32, timezone: Tz) -> Ticker {
        let (tx, ticks) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let next = next_daily_firing(Utc::now(), hour, minute, timezone);
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                if tx.send(()).await.is_err() {
                    return;
                }
            }
        });
        Ticker { ticks, cancel, task }
    }

    /// Waits for the next tick. `None` means the ticker was stopped.
    pub async fn tick(&mut self) -> Option<()> {
        self.ticks.recv().await
    }

    /// Stops the ticker and joins its task.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// First occurrence of hour:minute in `timezone` strictly after `now`.
///
/// The scan starts a week back and walks forward day by day, which keeps the
/// firing schedule correct across DST transitions: a wall-clock time that
/// falls in a spring-forward gap is shifted an hour later instead of being
/// dropped, and an ambiguous fall-back time fires on its first occurrence.
fn next_daily_firing(now: DateTime<Utc>, hour: u32, minute: u32, timezone: Tz) -> DateTime<Utc> {
    let start = (now.with_timezone(&timezone) - ChronoDuration::days(7)).date_naive();
    for offset in 0u64..400 {
        let Some(date) = start.checked_add_days(Days::new(offset)) else {
            break;
        };
        let Some(local) = date.and_hms_opt(hour, minute, 0) else {
            break;
        };
        let candidate = match timezone.from_local_datetime(&local) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t,
            LocalResult::None => {
                match timezone.from_local_datetime(&(local + ChronoDuration::hours(1))) {
                    LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t,
                    LocalResult::None => continue,
                }
            }
        };
        let candidate = candidate.with_timezone(&Utc);
        if candidate > now {
            return candidate;
        }
    }
    now + ChronoDuration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    #[tokio::test(start_paused = true)]
    async fn periodic_first_tick_is_jittered() {
        let period = Duration::from_secs(10);
        let start = tokio::time::Instant::now();
        let mut ticker = Ticker::periodic(period);
        assert!(ticker.tick().await.is_some());
        assert!(start.elapsed() < period);
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_every_period() {
        let period = Duration::from_secs(10);
        let mut ticker = Ticker::periodic(period);
        ticker.tick().await.unwrap();
        for _ in 0..3 {
            let before = tokio::time::Instant::now();
            ticker.tick().await.unwrap();
            assert_eq!(before.elapsed(), period);
        }
        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_the_task() {
        let ticker = Ticker::periodic(Duration::from_secs(3600));
        ticker.stop().await;
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_fires_later_today_if_not_yet_passed() {
        // 06:00 in New York; the 09:00 firing is still ahead.
        let now = utc(2024, 6, 1, 10, 0);
        let next = next_daily_firing(now, 9, 0, New_York);
        assert_eq!(next, utc(2024, 6, 1, 13, 0));
    }

    #[test]
    fn daily_rolls_over_to_tomorrow() {
        // 12:00 in New York; today's 09:00 already fired.
        let now = utc(2024, 6, 1, 16, 0);
        let next = next_daily_firing(now, 9, 0, New_York);
        assert_eq!(next, utc(2024, 6, 2, 13, 0));
    }

    #[test]
    fn spring_forward_gap_shifts_an_hour() {
        // 2024-03-10 02:30 does not exist in New York; the firing moves to
        // 03:30 EDT.
        let now = utc(2024, 3, 10, 5, 0);
        let next = next_daily_firing(now, 2, 30, New_York);
        assert_eq!(next, utc(2024, 3, 10, 7, 30));
    }

    #[test]
    fn fall_back_fires_on_first_occurrence() {
        // 2024-11-03 01:30 happens twice in New York; the EDT one wins.
        let now = utc(2024, 11, 3, 5, 0);
        let next = next_daily_firing(now, 1, 30, New_York);
        assert_eq!(next, utc(2024, 11, 3, 5, 30));
    }
}
