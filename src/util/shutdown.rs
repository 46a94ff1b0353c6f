use tokio::sync::watch;

/// Completes when `true` is signalled through the channel, or when the sending side is dropped.
///
/// This is a separate function so the borrowed value does not end up in the state of a caller's
///  `select!`.
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|is_shutdown| *is_shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::timeout;

    #[test]
    fn test_shutdown_signalled() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (sender, mut receiver) = watch::channel(false);
            assert!(timeout(Duration::from_secs(1), shutdown_signalled(&mut receiver)).await.is_err());

            sender.send_replace(true);
            assert!(timeout(Duration::from_secs(1), shutdown_signalled(&mut receiver)).await.is_ok());
        });
    }

    #[test]
    fn test_dropped_sender_counts_as_shutdown() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (sender, mut receiver) = watch::channel(false);
            drop(sender);
            assert!(timeout(Duration::from_secs(1), shutdown_signalled(&mut receiver)).await.is_ok());
        });
    }
}
