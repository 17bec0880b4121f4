use anyhow::{Context as _, Result, anyhow};
use futures::FutureExt as _;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use super::codec::{FrameBuffer, LinkCodec};
use super::envelope::{Envelope, MessageKind};
use super::protocol::{
    CallMessage, ErrorMessage, EventMessage, GoodbyeMessage, HelloMessage, ResultMessage,
    SubscribeMessage, SubscribedMessage, UnsubscribeMessage, WelcomeMessage,
};
use crate::config::ClientConfig;
use crate::session::{
    Connection, ConnectionListener, Event, EventHandler, Options, Session, SubscriptionHandle,
    TransportError,
};

const CLIENT_INFO: &str = concat!("wamp-persist/", env!("CARGO_PKG_VERSION"));
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 4096;

/// Router address parsed from a `tcp://` or `unix://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw).map_err(|e| TransportError::Protocol(format!("bad url: {e}")))?;

        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| TransportError::Protocol("tcp url without host".to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| TransportError::Protocol("tcp url without port".to_owned()))?;
                Ok(Self::Tcp(format!("{host}:{port}")))
            }
            #[cfg(unix)]
            "unix" => match url.path() {
                "" | "/" => Err(TransportError::Protocol(
                    "unix url without socket path".to_owned(),
                )),
                path => Ok(Self::Unix(PathBuf::from(path))),
            },
            other => Err(TransportError::Protocol(format!("unsupported scheme '{other}'"))),
        }
    }

    async fn connect(&self) -> std::io::Result<Box<dyn LinkStream>> {
        match self {
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for S {}

/// [`Connection`] backed by a router link.
///
/// `open` spawns a driver task that connects, performs the handshake and
/// reports every session to the listener, reconnecting per the configured
/// reconnect policy. Must be opened inside a Tokio runtime.
/// Dropping the connection stops the driver.
pub struct RouterConnection {
    config: ClientConfig,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RouterConnection {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            driver: Mutex::new(None),
        }
    }
}

impl Connection for RouterConnection {
    fn open(&self, listener: Arc<dyn ConnectionListener>) {
        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            log::warn!("Router link to {} is already open", self.config.url);
            return;
        }

        let config = self.config.clone();
        *driver = Some(tokio::spawn(async move {
            if let Err(e) = drive(&config, listener.as_ref()).await {
                log::error!("Router link to {} stopped: {e:#}", config.url);
            }
        }));
    }
}

impl Drop for RouterConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

struct Handshake {
    stream: Box<dyn LinkStream>,
    buffer: FrameBuffer,
    welcome: WelcomeMessage,
}

async fn drive(config: &ClientConfig, listener: &dyn ConnectionListener) -> Result<()> {
    let endpoint = Endpoint::parse(&config.url)?;
    let manager = config.reconnect.create_manager();

    loop {
        let Handshake {
            stream,
            buffer,
            welcome,
        } = manager
            .reconnect_loop(|| establish(&endpoint, &config.realm))
            .await?;

        log::info!(
            "Joined realm {} on {endpoint} as session {} (router: {})",
            config.realm,
            welcome.session_id,
            welcome.router.as_deref().unwrap_or("unknown")
        );

        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        let session = Arc::new(RouterSession::new(outgoing));
        listener.on_open(session.clone());

        match run_link(stream, buffer, &session.dispatch, outgoing_receiver).await {
            Ok(()) => log::info!("Router link to {endpoint} closed"),
            Err(e) => log::warn!("Router link to {endpoint} failed: {e:#}"),
        }

        session.dispatch.lock().shutdown();
        listener.on_close();

        if !config.reconnect.enabled {
            return Ok(());
        }
        tokio::time::sleep(manager.initial_delay()).await;
    }
}

async fn establish(endpoint: &Endpoint, realm: &str) -> Result<Handshake> {
    let mut stream = endpoint
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;

    let hello = HelloMessage {
        realm: realm.to_owned(),
        client_info: Some(CLIENT_INFO.to_owned()),
        features: vec!["call".to_owned(), "subscribe".to_owned()],
    };
    send_message(&mut stream, &Envelope::with_message(MessageKind::Hello, &hello)?).await?;

    let mut buffer = FrameBuffer::new();
    let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_welcome(&mut stream, &mut buffer))
        .await
        .map_err(|elapsed| anyhow!("Handshake with {endpoint} timed out: {elapsed}"))??;

    Ok(Handshake {
        stream,
        buffer,
        welcome,
    })
}

async fn await_welcome<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    buffer: &mut FrameBuffer,
) -> Result<WelcomeMessage> {
    let mut read_buf = vec![0u8; READ_CHUNK];

    loop {
        if let Some(envelope) = buffer.try_decode()? {
            return match envelope.kind {
                MessageKind::Welcome => Ok(envelope.message()?),
                MessageKind::Goodbye => {
                    let goodbye: GoodbyeMessage = envelope.message()?;
                    Err(anyhow!("Router refused the session: {}", goodbye.reason))
                }
                MessageKind::Error => {
                    let error: ErrorMessage = envelope.message()?;
                    Err(anyhow!("Router rejected hello: {}: {}", error.uri, error.message))
                }
                other => Err(anyhow!("Unexpected {other} during handshake")),
            };
        }

        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Err(anyhow!("Router closed the connection during handshake"));
        }
        buffer.push(&read_buf[..n]);
    }
}

/// Pumps frames until the router goes away. `Ok` means an orderly close.
async fn run_link(
    mut stream: Box<dyn LinkStream>,
    mut buffer: FrameBuffer,
    dispatch: &Mutex<Dispatch>,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
) -> Result<()> {
    let mut read_buf = vec![0u8; READ_CHUNK];

    loop {
        while let Some(envelope) = buffer.try_decode()? {
            if let Some(goodbye) = route(dispatch, envelope)? {
                log::info!("Router said goodbye: {}", goodbye.reason);
                return Ok(());
            }
        }

        tokio::select! {
            result = stream.read(&mut read_buf) => {
                let n = result.context("Failed to read from router")?;
                if n == 0 {
                    return Ok(());
                }
                buffer.push(&read_buf[..n]);
            }

            Some(envelope) = outgoing.recv() => {
                send_message(&mut stream, &envelope)
                    .await
                    .context("Failed to write to router")?;
            }
        }
    }
}

/// Settles the pending request an incoming envelope answers. Returns the
/// goodbye when the router ends the session.
fn route(dispatch: &Mutex<Dispatch>, envelope: Envelope) -> Result<Option<GoodbyeMessage>> {
    match envelope.kind {
        MessageKind::Event => {
            let event: EventMessage = envelope.message()?;
            let handler = dispatch.lock().handlers.get(&event.subscription).cloned();
            match handler {
                Some(handler) => handler(Event {
                    args: event.args,
                    kwargs: event.kwargs,
                }),
                None => log::debug!(
                    "Dropping event for unknown subscription {}",
                    event.subscription
                ),
            }
        }
        MessageKind::Goodbye => return Ok(Some(envelope.message()?)),
        MessageKind::Result
        | MessageKind::Error
        | MessageKind::Subscribed
        | MessageKind::Unsubscribed => {
            let mut dispatch = dispatch.lock();
            let Some(pending) = dispatch.pending.remove(&envelope.uuid) else {
                log::warn!("No pending request for {} {}", envelope.kind, envelope.uuid);
                return Ok(None);
            };
            dispatch.settle(pending, &envelope);
        }
        other => log::warn!("Unexpected {other} from router"),
    }
    Ok(None)
}

async fn send_message<S: AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    envelope: &Envelope,
) -> Result<()> {
    log::trace!("-> {} {}", envelope.kind, envelope.uuid);
    let encoded = LinkCodec::encode(envelope)?;
    stream.write_all(&encoded).await?;
    Ok(())
}

enum PendingReply {
    Call(oneshot::Sender<Result<Value, TransportError>>),
    Subscribe {
        handler: EventHandler,
        reply: oneshot::Sender<Result<SubscriptionHandle, TransportError>>,
    },
    Unsubscribe {
        subscription: u64,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

impl PendingReply {
    fn fail(self, error: TransportError) {
        let delivered = match self {
            Self::Call(reply) => reply.send(Err(error)).is_ok(),
            Self::Subscribe { reply, .. } => reply.send(Err(error)).is_ok(),
            Self::Unsubscribe { reply, .. } => reply.send(Err(error)).is_ok(),
        };
        if !delivered {
            log::trace!("Requester went away before the failure arrived");
        }
    }
}

/// Request bookkeeping shared by a session and its link task
#[derive(Default)]
struct Dispatch {
    closed: bool,
    pending: HashMap<String, PendingReply>,
    handlers: HashMap<u64, EventHandler>,
}

impl Dispatch {
    fn settle(&mut self, pending: PendingReply, envelope: &Envelope) {
        if envelope.kind == MessageKind::Error {
            pending.fail(match envelope.message::<ErrorMessage>() {
                Ok(error) => TransportError::Remote {
                    uri: error.uri,
                    message: error.message,
                },
                Err(e) => TransportError::Protocol(e.to_string()),
            });
            return;
        }

        let delivered = match (pending, envelope.kind) {
            (PendingReply::Call(reply), MessageKind::Result) => reply
                .send(
                    envelope
                        .message::<ResultMessage>()
                        .map(|result| result.value)
                        .map_err(|e| TransportError::Protocol(e.to_string())),
                )
                .is_ok(),
            (PendingReply::Subscribe { handler, reply }, MessageKind::Subscribed) => {
                match envelope.message::<SubscribedMessage>() {
                    Ok(subscribed) => {
                        self.handlers.insert(subscribed.subscription, handler);
                        reply.send(Ok(SubscriptionHandle(subscribed.subscription))).is_ok()
                    }
                    Err(e) => reply.send(Err(TransportError::Protocol(e.to_string()))).is_ok(),
                }
            }
            (PendingReply::Unsubscribe { subscription, reply }, MessageKind::Unsubscribed) => {
                self.handlers.remove(&subscription);
                reply.send(Ok(())).is_ok()
            }
            (pending, kind) => {
                pending.fail(TransportError::Protocol(format!("unexpected {kind} reply")));
                true
            }
        };

        if !delivered {
            log::trace!("Requester went away before {} {} arrived", envelope.kind, envelope.uuid);
        }
    }

    /// Fails every outstanding request and stops event delivery.
    fn shutdown(&mut self) {
        self.closed = true;
        self.handlers.clear();
        std::mem::take(&mut self.pending)
            .into_values()
            .for_each(|pending| pending.fail(TransportError::Closed));
    }
}

/// One joined session on a router link.
///
/// Requests are queued for the link task as soon as a method is called.
/// Once the link drops every outstanding and later request fails with
/// [`TransportError::Closed`].
pub struct RouterSession {
    outgoing: mpsc::UnboundedSender<Envelope>,
    dispatch: Mutex<Dispatch>,
}

impl RouterSession {
    fn new(outgoing: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            outgoing,
            dispatch: Mutex::new(Dispatch::default()),
        }
    }

    fn request<M: Serialize>(
        &self,
        kind: MessageKind,
        message: &M,
        pending: PendingReply,
    ) -> Result<(), TransportError> {
        let envelope = Envelope::with_message(kind, message)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let uuid = envelope.uuid.clone();

        let mut dispatch = self.dispatch.lock();
        if dispatch.closed {
            return Err(TransportError::Closed);
        }
        if self.outgoing.send(envelope).is_err() {
            return Err(TransportError::Closed);
        }
        dispatch.pending.insert(uuid, pending);
        Ok(())
    }
}

fn reply_future<T: Send + 'static>(
    sent: Result<(), TransportError>,
    receiver: oneshot::Receiver<Result<T, TransportError>>,
) -> BoxFuture<'static, Result<T, TransportError>> {
    match sent {
        Ok(()) => receiver
            .map(|reply| reply.unwrap_or(Err(TransportError::Closed)))
            .boxed(),
        Err(e) => future::ready(Err(e)).boxed(),
    }
}

impl Session for RouterSession {
    fn call(
        &self,
        target: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, TransportError>> {
        let message = CallMessage {
            procedure: target.to_owned(),
            args,
        };
        let (reply, receiver) = oneshot::channel();
        let sent = self.request(MessageKind::Call, &message, PendingReply::Call(reply));
        reply_future(sent, receiver)
    }

    fn subscribe(
        &self,
        target: &str,
        handler: EventHandler,
        options: Options,
    ) -> BoxFuture<'static, Result<SubscriptionHandle, TransportError>> {
        let message = SubscribeMessage {
            topic: target.to_owned(),
            options,
        };
        let (reply, receiver) = oneshot::channel();
        let sent = self.request(
            MessageKind::Subscribe,
            &message,
            PendingReply::Subscribe { handler, reply },
        );
        reply_future(sent, receiver)
    }

    fn unsubscribe(
        &self,
        handle: SubscriptionHandle,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let message = UnsubscribeMessage {
            subscription: handle.0,
        };
        let (reply, receiver) = oneshot::channel();
        let sent = self.request(
            MessageKind::Unsubscribe,
            &message,
            PendingReply::Unsubscribe {
                subscription: handle.0,
                reply,
            },
        );
        reply_future(sent, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> (RouterSession, mpsc::UnboundedReceiver<Envelope>) {
        let (outgoing, receiver) = mpsc::unbounded_channel();
        (RouterSession::new(outgoing), receiver)
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:8080").expect("tcp url"),
            Endpoint::Tcp("127.0.0.1:8080".to_owned())
        );
        #[cfg(unix)]
        assert_eq!(
            Endpoint::parse("unix:///tmp/router.sock").expect("unix url"),
            Endpoint::Unix(PathBuf::from("/tmp/router.sock"))
        );

        assert!(Endpoint::parse("tcp://localhost").is_err());
        assert!(Endpoint::parse("ws://localhost:8080/ws").is_err());
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_call_is_sent_at_invocation() {
        let (session, mut wire) = session();

        let reply = session.call("com.example.add", vec![json!(1), json!(2)]);

        let request = wire.try_recv().expect("request already queued");
        assert_eq!(request.kind, MessageKind::Call);
        let call: CallMessage = request.message().expect("call payload");
        assert_eq!(call.procedure, "com.example.add");

        let result = request
            .reply(MessageKind::Result, &ResultMessage { value: json!(3) })
            .expect("reply");
        assert!(route(&session.dispatch, result).expect("routed").is_none());

        assert_eq!(reply.await, Ok(json!(3)));
    }

    #[tokio::test]
    async fn test_error_reply_is_remote_error() {
        let (session, mut wire) = session();
        let reply = session.call("com.example.missing", vec![]);

        let request = wire.try_recv().expect("request queued");
        let error = request
            .reply(
                MessageKind::Error,
                &ErrorMessage {
                    uri: "wamp.error.no_such_procedure".to_owned(),
                    message: "no callee".to_owned(),
                },
            )
            .expect("reply");
        route(&session.dispatch, error).expect("routed");

        assert_eq!(
            reply.await,
            Err(TransportError::Remote {
                uri: "wamp.error.no_such_procedure".to_owned(),
                message: "no callee".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn test_events_reach_subscription_handler() {
        let (session, mut wire) = session();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: EventHandler = Arc::new(move |event: Event| {
            assert_eq!(event.args, vec![json!("tick")]);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let subscribed = session.subscribe("com.example.ticks", handler, Options::new());
        let request = wire.try_recv().expect("subscribe queued");
        let reply = request
            .reply(MessageKind::Subscribed, &SubscribedMessage { subscription: 42 })
            .expect("reply");
        route(&session.dispatch, reply).expect("routed");
        assert_eq!(subscribed.await, Ok(SubscriptionHandle(42)));

        let event = EventMessage {
            subscription: 42,
            args: vec![json!("tick")],
            kwargs: serde_json::Map::new(),
        };
        let envelope = Envelope::with_message(MessageKind::Event, &event).expect("event");
        route(&session.dispatch, envelope).expect("routed");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding_and_later_requests() {
        let (session, _wire) = session();
        let outstanding = session.call("com.example.slow", vec![]);

        session.dispatch.lock().shutdown();

        assert_eq!(outstanding.await, Err(TransportError::Closed));
        assert_eq!(
            session.call("com.example.late", vec![]).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_goodbye_ends_link() {
        let (session, _wire) = session();
        let goodbye = Envelope::with_message(
            MessageKind::Goodbye,
            &GoodbyeMessage {
                reason: "wamp.close.system_shutdown".to_owned(),
            },
        )
        .expect("goodbye");

        let ended = route(&session.dispatch, goodbye).expect("routed");
        assert_eq!(
            ended.map(|goodbye| goodbye.reason).as_deref(),
            Some("wamp.close.system_shutdown")
        );
    }
}
