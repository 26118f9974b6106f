use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs `tick` every `period` until `token` is cancelled.
///
/// A panicking tick is logged and the loop carries on with the next one.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, token: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = AssertUnwindSafe(tick()).catch_unwind().await {
                        log::error!("{} panicked, {}", name, panic_message(e.as_ref()));
                    }
                }
            }
        }
        log::debug!("{} stopped", name);
    })
}

fn panic_message(e: &(dyn Any + Send)) -> &str {
    if let Some(s) = e.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
