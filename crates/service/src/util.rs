use crate::error::ServiceError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Race a fallible future against request cancellation. Cancellation wins
/// ties; the abandoned future is dropped, which aborts any in-flight I/O.
pub async fn with_cancel<T>(
    ctx: &CancellationToken,
    fut: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ServiceError::Canceled),
        out = fut => out,
    }
}

/// Parse a human duration of the form `300ms`, `30s`, `2m` or `1h`. A bare
/// number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ServiceError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ServiceError::InvalidRequest("empty duration".into()));
    }

    let (value, unit) = match input.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(pos) => input.split_at(pos),
        None => (input, "s"),
    };

    let value: f64 = value
        .parse()
        .map_err(|_| ServiceError::InvalidRequest(format!("invalid duration: {input}")))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid duration unit: {input}"
            )))
        }
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(ServiceError::InvalidRequest(format!(
            "invalid duration: {input}"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[tokio::test]
    async fn with_cancel_aborts_pending_work() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = with_cancel(&ctx, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_canceled());

        let ctx = CancellationToken::new();
        let out = with_cancel(&ctx, async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
    }
}
