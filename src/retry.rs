/// Awaits a store operation up to three times, 500 ms apart, logging each failed attempt.
/// `$operation` is re-evaluated on every attempt, so it must build a fresh future.
macro_rules! retry_store_operation {
    ($context:expr, $operation:expr) => {{
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY_MILLIS: u64 = 500;

        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= MAX_ATTEMPTS => break Err(err),
                Err(err) => {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        MAX_ATTEMPTS,
                        context_value,
                        err,
                        RETRY_DELAY_MILLIS
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MILLIS))
                        .await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_store_operation;
