use std::time::Duration;

use futures::channel::mpsc::UnboundedSender;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod parser;
mod registry;

pub use parser::{events, Event, EventParser};
pub use registry::{ConnectionRegistry, Subscription, PING_CHECK_INTERVAL, PING_TIMEOUT};

/// Upper bound of the random delay between an event and the reconcile it triggers
pub const MAX_TRIGGER_JITTER: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum Error {
    #[error("event stream failed: {0}")]
    Stream(String),

    #[error("event stream closed by the platform")]
    Closed,

    #[error("no ping received for {0:?}")]
    Stale(Duration),
}

/// Folder filter sent when subscribing, `**` matches every sub folder
pub fn subscription_path(secrets_path: &str, recursive: bool) -> String {
    if recursive {
        format!("{secrets_path}**")
    } else {
        secrets_path.to_string()
    }
}

/// Turn every event of a subscription into a reconcile trigger for `target`.
///
/// Triggers are spread over a random delay so a burst of platform changes does not
/// stampede the controller. Stops on the first stream error, on cancellation, or when the
/// trigger channel closes.
pub fn forward<T>(mut subscription: Subscription, target: T, trigger: UnboundedSender<T>) -> JoinHandle<()>
where
    T: Clone + std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        let cancel = subscription.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                err = subscription.errors.recv() => {
                    if let Some(err) = err {
                        warn!(%target, "instant updates stopped: {err}");
                    }
                    break;
                }
                event = subscription.events.recv() => {
                    let Some(event) = event else { break };
                    info!(%target, kind = event.event.as_deref().unwrap_or("message"), "received platform event");

                    let delay = rand::thread_rng().gen_range(Duration::ZERO..MAX_TRIGGER_JITTER);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if trigger.unbounded_send(target.clone()).is_err() {
                        break;
                    }
                }
            }
        }
        debug!(%target, "event forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::{channel::mpsc, StreamExt};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[test]
    fn recursive_subscriptions_match_sub_folders() {
        assert_eq!(subscription_path("/app", true), "/app**");
        assert_eq!(subscription_path("/app", false), "/app");
    }

    #[tokio::test(start_paused = true)]
    async fn events_become_delayed_triggers() {
        let registry = ConnectionRegistry::new(&CancellationToken::new());
        let (chunks, rx) = mpsc::unbounded::<Result<Vec<u8>, String>>();
        let subscription = registry
            .subscribe(|| futures::future::ready(Ok::<_, Infallible>(rx)))
            .await
            .unwrap()
            .unwrap();

        let (trigger, mut triggers) = mpsc::unbounded();
        let handle = forward(subscription, "ns/app".to_string(), trigger);

        chunks
            .unbounded_send(Ok(b"event: secret:update\ndata: {}\n\n".to_vec()))
            .unwrap();
        assert_eq!(triggers.next().await.as_deref(), Some("ns/app"));

        registry.close().await;
        handle.await.unwrap();
    }
}
