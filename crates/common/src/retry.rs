use std::time::Duration;

/// Retry `f` with exponential backoff.
///
/// # Arguments
/// * `f` - The fallible operation
/// * `max_attempts` - Total number of attempts (at least one attempt is always made)
/// * `base_delay_ms` - Delay before the second attempt, doubled for every further one
/// * `operation_name` - Human-readable name for logging
pub fn retry_with_backoff<F, T, E>(
    mut f: F,
    max_attempts: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < max_attempts => {
                let delay = backoff_delay(base_delay_ms, attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {}ms...",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    operation_name,
                    max_attempts,
                    e
                );
                return Err(e);
            }
        }
    }
}

fn backoff_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt.min(16))))
}
