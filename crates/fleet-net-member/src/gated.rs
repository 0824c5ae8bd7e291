//! Sub-controllers that only run while the member has joined the fleet

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_net_common::{Error, Result};

use crate::internalmembercluster::MemberController;

/// Builds a controller future that runs until its token is cancelled
pub type ControllerFactory = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A controller that is started on Join and stopped on Leave
///
/// Both operations are idempotent: joining a running controller and leaving
/// a stopped one are no-ops.
pub struct GatedController {
    name: &'static str,
    factory: ControllerFactory,
    parent: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl GatedController {
    /// Gate the controller built by `factory`; it also stops when `parent` fires
    pub fn new(name: &'static str, parent: CancellationToken, factory: ControllerFactory) -> Self {
        Self {
            name,
            factory,
            parent,
            running: Mutex::new(None),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the controller task is currently running
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

#[async_trait]
impl MemberController for GatedController {
    async fn join(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(controller = self.name, "Controller is already running");
            return Ok(());
        }
        if self.parent.is_cancelled() {
            return Err(Error::cancelled(format!("start {}", self.name)));
        }

        let token = self.parent.child_token();
        let handle = tokio::spawn((self.factory)(token.clone()));
        *running = Some(Running { token, handle });
        info!(controller = self.name, "Started controller");
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        let Some(Running { token, handle }) = self.running.lock().await.take() else {
            debug!(controller = self.name, "Controller is not running");
            return Ok(());
        };

        token.cancel();
        match handle.await {
            Ok(()) => {
                info!(controller = self.name, "Stopped controller");
                Ok(())
            }
            Err(e) if e.is_panic() => {
                warn!(controller = self.name, error = %e, "Controller panicked");
                Err(Error::internal_with_context(self.name, format!("controller panicked: {e}")))
            }
            Err(e) => Err(Error::internal_with_context(self.name, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    fn counting_factory(started: Arc<AtomicUsize>, stopped: Arc<AtomicUsize>) -> ControllerFactory {
        Arc::new(move |token: CancellationToken| {
            let started = started.clone();
            let stopped = stopped.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let gated = GatedController::new(
            "test",
            CancellationToken::new(),
            counting_factory(started.clone(), stopped.clone()),
        );

        gated.join().await.unwrap();
        gated.join().await.unwrap();
        tokio::task::yield_now().await;
        assert!(gated.is_running().await);

        gated.leave().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!gated.is_running().await);
    }

    #[tokio::test]
    async fn leave_without_join_is_a_noop() {
        let gated = GatedController::new(
            "test",
            CancellationToken::new(),
            Arc::new(|_: CancellationToken| async {}.boxed()),
        );
        gated.leave().await.unwrap();
        gated.leave().await.unwrap();
    }

    #[tokio::test]
    async fn rejoin_after_leave_restarts() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let gated = GatedController::new(
            "test",
            CancellationToken::new(),
            counting_factory(started.clone(), stopped.clone()),
        );

        gated.join().await.unwrap();
        gated.leave().await.unwrap();
        gated.join().await.unwrap();
        gated.leave().await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_parent_refuses_join() {
        let parent = CancellationToken::new();
        parent.cancel();
        let gated = GatedController::new("test", parent, Arc::new(|_: CancellationToken| async {}.boxed()));
        assert!(gated.join().await.is_err());
    }

    #[tokio::test]
    async fn panicking_controller_reports_on_leave() {
        let gated = GatedController::new(
            "test",
            CancellationToken::new(),
            Arc::new(|_: CancellationToken| async { panic!("boom") }.boxed()),
        );
        gated.join().await.unwrap();
        assert!(gated.leave().await.is_err());
    }
}
