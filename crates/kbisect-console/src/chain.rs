use std::sync::Arc;

use tracing::{info, warn};

use crate::{CaptureHandle, ConsoleCollector};

/// Ordered set of collectors; the first that starts wins. Capture is
/// best-effort: when every collector fails the chain returns `None` and the
/// bisection carries on without console logs.
pub struct ConsoleChain {
    collectors: Vec<Arc<dyn ConsoleCollector>>,
}

impl ConsoleChain {
    pub fn new(collectors: Vec<Arc<dyn ConsoleCollector>>) -> Self {
        Self { collectors }
    }

    pub fn empty() -> Self {
        Self {
            collectors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub async fn start(&self) -> Option<CaptureHandle> {
        for collector in &self.collectors {
            match collector.start().await {
                Ok(handle) => {
                    info!(provider = collector.provider_key(), "console capture started");
                    return Some(handle);
                }
                Err(err) => {
                    warn!(
                        provider = collector.provider_key(),
                        "console collector failed to start, trying next: {err}"
                    );
                }
            }
        }
        if !self.collectors.is_empty() {
            warn!("console capture unavailable, continuing without it");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::process::Command;

    use super::ConsoleChain;
    use crate::providers::spawn_capture;
    use crate::{
        CaptureHandle, ConsoleCollector, ConsoleCollectorKind, ConsoleError, ConsoleResult,
    };

    struct FailingCollector {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ConsoleCollector for FailingCollector {
        fn kind(&self) -> ConsoleCollectorKind {
            ConsoleCollectorKind::Conserver
        }

        async fn start(&self) -> ConsoleResult<CaptureHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ConsoleError::Start("concentrator refused".to_owned()))
        }
    }

    struct CatCollector;

    #[async_trait]
    impl ConsoleCollector for CatCollector {
        fn kind(&self) -> ConsoleCollectorKind {
            ConsoleCollectorKind::IpmiSol
        }

        async fn start(&self) -> ConsoleResult<CaptureHandle> {
            let mut command = Command::new("sh");
            command.arg("-c").arg("printf 'sol output'; sleep 30");
            let capture = spawn_capture(self.kind(), command, None, None)?;
            Ok(CaptureHandle::new(capture))
        }
    }

    #[tokio::test]
    async fn chain_falls_back_to_the_next_collector() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = ConsoleChain::new(vec![
            Arc::new(FailingCollector {
                calls: Arc::clone(&calls),
            }),
            Arc::new(CatCollector),
        ]);

        let handle = chain.start().await.expect("fallback collector starts");
        assert_eq!(handle.kind(), ConsoleCollectorKind::IpmiSol);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let captured = handle.stop().await;
        assert_eq!(captured, b"sol output");
    }

    #[tokio::test]
    async fn exhausted_chain_returns_none() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = ConsoleChain::new(vec![
            Arc::new(FailingCollector {
                calls: Arc::clone(&calls),
            }),
            Arc::new(FailingCollector {
                calls: Arc::clone(&calls),
            }),
        ]);
        assert!(chain.start().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_chain_is_silent() {
        assert!(ConsoleChain::empty().start().await.is_none());
    }
}
