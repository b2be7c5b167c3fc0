//! Shutdown signalling over `tokio::sync::watch` channels.
//!
//! A `true` value on the channel requests shutdown. A dropped sender that
//! never signalled is treated as "keep running".

use tokio::sync::watch;

/// Resolves once shutdown has been requested on `shutdown`
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

/// A receiver that never signals shutdown
pub fn never_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dropped_sender_never_fires() {
        let mut rx = never_shutdown();
        let fired = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(&mut rx)).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_signal_fires() -> anyhow::Result<()> {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(1), waiter).await??;
        Ok(())
    }
}
