//! In-process router speaking the link protocol over TCP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wamp_persist_client::ClientConfig;
use wamp_persist_client::link::protocol::{
    CallMessage, ErrorMessage, EventMessage, ResultMessage, SubscribeMessage, SubscribedMessage,
    UnsubscribeMessage, WelcomeMessage,
};
use wamp_persist_client::link::{Envelope, FrameBuffer, LinkCodec, MessageKind, ReconnectConfig};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| env_logger::builder().is_test(true).init());
}

#[derive(Clone)]
enum Command {
    Publish { topic: String, args: Vec<Value> },
    Kick,
}

#[derive(Default)]
struct Counters {
    welcomes: AtomicUsize,
    subscribes: AtomicUsize,
    next_subscription: AtomicU64,
}

/// Procedures: `echo` returns its arguments, `fail` answers with an error.
pub struct TestRouter {
    url: String,
    counters: Arc<Counters>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
    accept_task: JoinHandle<()>,
}

impl TestRouter {
    pub async fn start() -> Result<Self> {
        init_logger();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("tcp://{}", listener.local_addr()?);
        let counters = Arc::new(Counters::default());
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_task = tokio::spawn({
            let counters = counters.clone();
            let connections = connections.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (sender, commands) = mpsc::unbounded_channel();
                    connections.lock().push(sender);
                    let counters = counters.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &counters, commands).await {
                            log::debug!("Test router connection ended: {e:#}");
                        }
                    });
                }
            }
        });

        Ok(Self {
            url,
            counters,
            connections,
            accept_task,
        })
    }

    /// Client configuration with fast reconnects
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.url.clone()).reconnect(ReconnectConfig {
            min_interval_ms: 20,
            max_interval_ms: 200,
            ..ReconnectConfig::default()
        })
    }

    pub fn welcomes(&self) -> usize {
        self.counters.welcomes.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.counters.subscribes.load(Ordering::SeqCst)
    }

    pub fn publish(&self, topic: &str, args: Vec<Value>) {
        self.broadcast(&Command::Publish {
            topic: topic.to_owned(),
            args,
        });
    }

    /// Drop every open client connection
    pub fn kick_all(&self) {
        self.broadcast(&Command::Kick);
    }

    fn broadcast(&self, command: &Command) {
        self.connections
            .lock()
            .retain(|connection| connection.send(command.clone()).is_ok());
    }
}

impl Drop for TestRouter {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    counters: &Counters,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let mut buffer = FrameBuffer::new();
    let mut read_buf = vec![0u8; 4096];
    let mut subscriptions: HashMap<u64, String> = HashMap::new();

    loop {
        tokio::select! {
            result = stream.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                buffer.push(&read_buf[..n]);

                while let Some(request) = buffer.try_decode()? {
                    let Some(reply) = answer(&request, counters, &mut subscriptions)? else {
                        return Ok(());
                    };
                    stream.write_all(&LinkCodec::encode(&reply)?).await?;
                }
            }

            Some(command) = commands.recv() => match command {
                Command::Publish { topic, args } => {
                    let matching: Vec<u64> = subscriptions
                        .iter()
                        .filter(|(_, subscribed)| **subscribed == topic)
                        .map(|(id, _)| *id)
                        .collect();
                    for subscription in matching {
                        let event = EventMessage {
                            subscription,
                            args: args.clone(),
                            kwargs: serde_json::Map::new(),
                        };
                        let envelope = Envelope::with_message(MessageKind::Event, &event)?;
                        stream.write_all(&LinkCodec::encode(&envelope)?).await?;
                    }
                }
                Command::Kick => return Ok(()),
            },
        }
    }
}

/// Reply to one client request. `None` ends the connection.
fn answer(
    request: &Envelope,
    counters: &Counters,
    subscriptions: &mut HashMap<u64, String>,
) -> Result<Option<Envelope>> {
    let reply = match request.kind {
        MessageKind::Hello => {
            let session_id = counters.welcomes.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            request.reply(
                MessageKind::Welcome,
                &WelcomeMessage {
                    session_id,
                    router: Some("test-router".to_owned()),
                },
            )?
        }
        MessageKind::Call => {
            let call: CallMessage = request.message()?;
            match call.procedure.as_str() {
                "echo" => request.reply(
                    MessageKind::Result,
                    &ResultMessage {
                        value: json!(call.args),
                    },
                )?,
                "fail" => request.reply(
                    MessageKind::Error,
                    &ErrorMessage {
                        uri: "app.error.failed".to_owned(),
                        message: "requested failure".to_owned(),
                    },
                )?,
                _ => request.reply(
                    MessageKind::Error,
                    &ErrorMessage {
                        uri: "wamp.error.no_such_procedure".to_owned(),
                        message: call.procedure,
                    },
                )?,
            }
        }
        MessageKind::Subscribe => {
            let subscribe: SubscribeMessage = request.message()?;
            counters.subscribes.fetch_add(1, Ordering::SeqCst);
            let subscription = counters.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
            subscriptions.insert(subscription, subscribe.topic);
            request.reply(MessageKind::Subscribed, &SubscribedMessage { subscription })?
        }
        MessageKind::Unsubscribe => {
            let unsubscribe: UnsubscribeMessage = request.message()?;
            subscriptions.remove(&unsubscribe.subscription);
            request.reply(MessageKind::Unsubscribed, &Value::Null)?
        }
        MessageKind::Goodbye => return Ok(None),
        other => anyhow::bail!("client sent {other}"),
    };
    Ok(Some(reply))
}

/// Poll `condition` until it holds or a few seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}
