use anyhow::Result;
use std::thread;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Run a store operation up to three times, waiting between attempts.
pub fn retry_store_operation<T, F>(context: impl Into<String>, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_with_delay(context, RETRY_DELAY, operation)
}

pub fn retry_with_delay<T, F>(context: impl Into<String>, delay: Duration, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let context_value: String = context.into();
    let mut attempt = 1;

    loop {
        match operation() {
            Ok(value) => break Ok(value),
            Err(err) if attempt >= MAX_ATTEMPTS => break Err(err),
            Err(err) => {
                log::warn!(
                    "Attempt {}/{} for {} failed: {}. Retrying in {}s.",
                    attempt,
                    MAX_ATTEMPTS,
                    context_value,
                    err,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let value = retry_with_delay("flaky read", Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<()> = retry_with_delay("dead store", Duration::ZERO, || {
            calls += 1;
            Err(anyhow!("still down"))
        });
        assert_eq!(calls, MAX_ATTEMPTS);
        assert_eq!(result.unwrap_err().to_string(), "still down");
    }
}
