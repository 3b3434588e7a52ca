use std::time::Duration;

/// Next delay in a doubling backoff schedule, capped at `max_delay`.
pub fn next_backoff_delay(current: Duration, max_delay: Duration) -> Duration {
    if current.is_zero() {
        return max_delay;
    }
    (current * 2).min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let max = Duration::from_millis(1000);
        let mut delay = Duration::from_millis(200);
        delay = next_backoff_delay(delay, max);
        assert_eq!(delay, Duration::from_millis(400));
        delay = next_backoff_delay(delay, max);
        assert_eq!(delay, Duration::from_millis(800));
        delay = next_backoff_delay(delay, max);
        assert_eq!(delay, Duration::from_millis(1000));
        delay = next_backoff_delay(delay, max);
        assert_eq!(delay, Duration::from_millis(1000));
    }

    #[test]
    fn zero_jumps_to_max() {
        assert_eq!(
            next_backoff_delay(Duration::ZERO, Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }
}
