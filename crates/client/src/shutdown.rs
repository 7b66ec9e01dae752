// Interrupt signalling shared by the long-running drivers.
//
// Drivers take a `watch::Receiver<bool>` that flips to true once. A dropped
// sender is not an interrupt: the receiver just never resolves.

use tokio::sync::watch;

/// Resolves once `shutdown` reads true.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn resolves_on_true_including_before_the_call() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        timeout(Duration::from_millis(10), wait_for_shutdown(&mut rx))
            .await
            .expect("already signalled");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_is_not_an_interrupt() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(timeout(Duration::from_secs(60), wait_for_shutdown(&mut rx)).await.is_err());
    }
}
