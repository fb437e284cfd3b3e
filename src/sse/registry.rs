use std::{
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use tokio::{
    sync::{mpsc, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{parser, Error, Event};

/// How often the liveness monitor checks for pings
pub const PING_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Connections silent for longer than this are torn down
pub const PING_TIMEOUT: Duration = Duration::from_secs(120);

const EVENT_BUFFER: usize = 32;

/// Receiving ends of a freshly opened connection
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::Receiver<Event>,
    pub errors: mpsc::UnboundedReceiver<Error>,
    /// Cancelled when the connection closes for any reason
    pub cancel: CancellationToken,
}

/// At most one live event stream per custom resource
#[derive(Debug)]
pub struct ConnectionRegistry {
    connection: RwLock<Option<CancellationToken>>,
    parent: CancellationToken,
    started: Instant,
    /// Milliseconds since `started` at which the last ping arrived
    last_ping: Arc<AtomicI64>,
}

pub(crate) fn is_stale(last_ping_ms: i64, now_ms: i64, timeout: Duration) -> bool {
    now_ms - last_ping_ms > timeout.as_millis() as i64
}

impl ConnectionRegistry {
    /// Connections are closed when `parent` is cancelled
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            connection: RwLock::new(None),
            parent: parent.clone(),
            started: Instant::now(),
            last_ping: Arc::new(AtomicI64::new(0)),
        }
    }

    fn elapsed_ms(started: Instant) -> i64 {
        started.elapsed().as_millis() as i64
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Open a connection unless a live one exists.
    ///
    /// Returns `None` when already connected, so only the caller that opened the connection
    /// consumes its events.
    pub async fn subscribe<F, Fut, S, B, E, C>(&self, connect: F) -> Result<Option<Subscription>, C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, C>>,
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.is_connected().await {
            return Ok(None);
        }

        let mut connection = self.connection.write().await;
        if connection
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
        {
            return Ok(None);
        }

        let stream = connect().await?;
        let cancel = self.parent.child_token();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        self.last_ping
            .store(Self::elapsed_ms(self.started), Ordering::SeqCst);

        tokio::spawn(read(
            stream,
            events_tx,
            errors_tx.clone(),
            cancel.clone(),
            self.started,
            self.last_ping.clone(),
        ));
        tokio::spawn(monitor(
            errors_tx,
            cancel.clone(),
            self.started,
            self.last_ping.clone(),
        ));

        *connection = Some(cancel.clone());
        Ok(Some(Subscription {
            events: events_rx,
            errors: errors_rx,
            cancel,
        }))
    }

    /// Close the live connection, if any
    pub async fn close(&self) {
        if let Some(token) = self.connection.write().await.take() {
            token.cancel();
        }
    }
}

async fn read<S, B, E>(
    stream: S,
    events_tx: mpsc::Sender<Event>,
    errors_tx: mpsc::UnboundedSender<Error>,
    cancel: CancellationToken,
    started: Instant,
    last_ping: Arc<AtomicI64>,
) where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut events = Box::pin(parser::events(stream));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(event)) if event.is_ping() => {
                    last_ping.store(ConnectionRegistry::elapsed_ms(started), Ordering::SeqCst);
                }
                Some(Ok(event)) => {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = errors_tx.send(Error::Stream(e.to_string()));
                    break;
                }
                None => {
                    let _ = errors_tx.send(Error::Closed);
                    break;
                }
            },
        }
    }
    cancel.cancel();
    debug!("event stream reader stopped");
}

async fn monitor(
    errors_tx: mpsc::UnboundedSender<Error>,
    cancel: CancellationToken,
    started: Instant,
    last_ping: Arc<AtomicI64>,
) {
    let mut interval = tokio::time::interval(PING_CHECK_INTERVAL);
    // first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let now = ConnectionRegistry::elapsed_ms(started);
                if is_stale(last_ping.load(Ordering::SeqCst), now, PING_TIMEOUT) {
                    warn!("no ping received within {:?}, closing event stream", PING_TIMEOUT);
                    let _ = errors_tx.send(Error::Stale(PING_TIMEOUT));
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}
