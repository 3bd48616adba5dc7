
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which refresh duty a timer drives.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerIdRefresh {
    #[default]
    Alloc,
    Perms,
    Binds,
}

/// `PeriodicTimerTimeoutHandler` is a handler called on timeout.
#[async_trait]
pub trait PeriodicTimerTimeoutHandler {
    async fn on_timeout(&mut self, id: TimerIdRefresh);
}

/// A fixed-interval refresh timer. The tick task is shut down through
/// one cancellation signal: a child of the owner's token, fired either
/// by [`PeriodicTimer::stop`] or by the owner going away.
#[derive(Default)]
pub struct PeriodicTimer {
    id: TimerIdRefresh,
    interval: Duration,
    stop: Mutex<Option<CancellationToken>>,
}

impl PeriodicTimer {
    /// Creates a new [`PeriodicTimer`].
    pub fn new(id: TimerIdRefresh, interval: Duration) -> Self {
        PeriodicTimer {
            id,
            interval,
            stop: Mutex::new(None),
        }
    }

    /// Spawns the tick task. Returns `false` when the timer is already
    /// running.
    pub async fn start<T: 'static + PeriodicTimerTimeoutHandler + Send>(
        &self,
        handler: Arc<Mutex<T>>,
        owner: CancellationToken,
    ) -> bool {
        let mut stop = self.stop.lock().await;
        if matches!(&*stop, Some(token) if !token.is_cancelled()) {
            return false;
        }

        let token = owner.child_token();
        *stop = Some(token.clone());

        let (id, interval) = (self.id, self.interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        handler.lock().await.on_timeout(id).await;
                    }
                }
            }
            log::trace!("refresh timer {id:?} stopped");
        });

        true
    }

    /// Stops the timer.
    pub async fn stop(&self) {
        if let Some(token) = self.stop.lock().await.take() {
            token.cancel();
        }
    }

    /// Tests if the timer is running.
    /// Debug purpose only.
    pub async fn is_running(&self) -> bool {
        matches!(&*self.stop.lock().await, Some(token) if !token.is_cancelled())
    }
}
