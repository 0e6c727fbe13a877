//! Deadline helpers for task-owned timers.

use tokio::time::Instant;

/// Sleeps until `deadline`, or forever when there is none. Meant for a
/// `tokio::select!` branch guarding an optional timer.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_missing_deadline_never_fires() {
        let res = tokio::time::timeout(Duration::from_secs(3600), sleep_until_deadline(None)).await;
        assert!(res.is_err());

        let start = Instant::now();
        sleep_until_deadline(Some(start + Duration::from_millis(500))).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
