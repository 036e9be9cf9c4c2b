//! Tokio driver for a [`Link`].
//!
//! One task owns the transport stream, the timer queue and the link. It
//! drains link actions (writes, timers, events), then waits on whichever
//! comes first: bytes from the transport, a command from a [`LinkHandle`],
//! or an expired timer. While a write is pending the transport keeps being
//! read, so two peers writing to each other at once never stall on full
//! buffers.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, instrument, warn};

use crate::config::LinkConfig;
use crate::core::frame::Channel;
use crate::error::{ProtocolError, Result};
use crate::protocol::command::Command;
use crate::protocol::dispatcher::{CommandMatcher, Request};
use crate::protocol::link::{Action, Link, LinkEvent, TimerKey};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

const READ_BUFFER_SIZE: usize = 4096;

/// Instructions from a [`LinkHandle`] to the driver task
pub enum DriverCommand {
    Submit(Request),
    SetMtu {
        mtu: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Cloneable handle to a running link
#[derive(Clone, Debug)]
pub struct LinkHandle {
    tx: mpsc::Sender<DriverCommand>,
}

impl LinkHandle {
    /// Queue an already-serialized payload with no response expected
    pub async fn send(&self, channel: Channel, payload: impl Into<Bytes>) -> Result<()> {
        self.submit(Request::new(channel, payload)).await
    }

    /// Queue a fully built request
    pub async fn submit(&self, request: Request) -> Result<()> {
        self.tx
            .send(DriverCommand::Submit(request))
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Send `payload` and wait for the first inbound command matching
    /// `matcher`. `timeout` overrides the configured request timeout.
    pub async fn request(
        &self,
        channel: Channel,
        payload: impl Into<Bytes>,
        matcher: CommandMatcher,
        timeout: Option<Duration>,
    ) -> Result<Command> {
        let (tx, rx) = oneshot::channel::<Result<Command>>();
        let reply = Arc::new(Mutex::new(Some(tx)));
        let (on_complete, on_timeout, on_error) = (reply.clone(), reply.clone(), reply);

        let mut request = Request::new(channel, payload)
            .expect(matcher)
            .on_complete(move |command| resolve(&on_complete, Ok(command.clone())))
            .on_timeout(move || resolve(&on_timeout, Err(ProtocolError::RequestTimeout)))
            .on_error(move |error| resolve(&on_error, Err(reported(error))));
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }

        self.submit(request).await?;
        rx.await.map_err(|_| ProtocolError::Disconnected)?
    }

    /// Change the MTU; chunked transfers in progress restart
    pub async fn set_mtu(&self, mtu: usize) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverCommand::SetMtu { mtu, reply })
            .await
            .map_err(|_| ProtocolError::Disconnected)?;
        rx.await.map_err(|_| ProtocolError::Disconnected)?
    }

    /// Tear the link down; pending requests fail with `Disconnected`
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(DriverCommand::Shutdown)
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Result<Command>>>>>;

fn resolve(slot: &ReplySlot, result: Result<Command>) {
    let sender = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(sender) = sender {
        // The caller may have stopped waiting
        let _ = sender.send(result);
    }
}

/// Copy of a request error for the waiting caller
fn reported(error: &ProtocolError) -> ProtocolError {
    match error {
        ProtocolError::Disconnected => ProtocolError::Disconnected,
        ProtocolError::RequestTimeout => ProtocolError::RequestTimeout,
        ProtocolError::HandshakeTimeout => ProtocolError::HandshakeTimeout,
        ProtocolError::NonceExhausted => ProtocolError::NonceExhausted,
        ProtocolError::AuthenticationFailed(reason) => ProtocolError::AuthenticationFailed(*reason),
        ProtocolError::TransferAbandoned(reason) => ProtocolError::TransferAbandoned(*reason),
        ProtocolError::SendFailed(reason) => ProtocolError::SendFailed(reason.clone()),
        other => ProtocolError::SendFailed(other.to_string()),
    }
}

/// Spawn the driver task for `link` over `transport`.
///
/// # Returns
///
/// The handle for sending, the receiver for [`LinkEvent`]s and the task's
/// join handle. The task ends when the link closes, the transport reaches end
/// of stream, or every handle has been dropped.
pub fn spawn_link<T>(
    link: Link,
    transport: T,
    config: &LinkConfig,
) -> (LinkHandle, mpsc::Receiver<LinkEvent>, JoinHandle<Result<()>>)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, commands) = mpsc::channel(config.requests.command_buffer.max(1));
    let (events, event_rx) = mpsc::channel(config.link.event_buffer.max(1));

    let (reader, writer) = tokio::io::split(transport);
    let driver = Driver {
        link,
        reader,
        writer,
        commands,
        events,
        timers: DelayQueue::new(),
        timer_keys: HashMap::new(),
        send_timeout: config.link.send_timeout,
        read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
    };

    (LinkHandle { tx }, event_rx, tokio::spawn(driver.run()))
}

struct Driver<T> {
    link: Link,
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    commands: mpsc::Receiver<DriverCommand>,
    events: mpsc::Sender<LinkEvent>,
    timers: DelayQueue<TimerKey>,
    timer_keys: HashMap<TimerKey, delay_queue::Key>,
    send_timeout: Duration,
    read_buf: BytesMut,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    #[instrument(skip_all, fields(role = ?self.link.role()))]
    async fn run(mut self) -> Result<()> {
        info!("link driver started");
        self.link.start()?;

        loop {
            if self.flush().await {
                break;
            }

            self.read_buf.reserve(READ_BUFFER_SIZE);
            tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => {
                    deliver(&mut self.link, &mut self.read_buf, read);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all link handles dropped");
                        self.link.shutdown();
                    }
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let key = expired.into_inner();
                    self.timer_keys.remove(&key);
                    self.link.on_timer(key);
                }
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "transport shutdown failed");
        }
        info!("link driver stopped");
        global_metrics().log_metrics();
        Ok(())
    }

    fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Submit(request) => {
                self.link.submit(request);
            }
            DriverCommand::SetMtu { mtu, reply } => {
                let _ = reply.send(self.link.set_mtu(mtu));
            }
            DriverCommand::Shutdown => self.link.shutdown(),
        }
    }

    /// Perform every pending link action. Returns true once the link closed.
    async fn flush(&mut self) -> bool {
        let mut closed = false;
        while let Some(action) = self.link.poll_action() {
            match action {
                Action::Transmit { bytes, origin } => match self.write_while_reading(&bytes).await {
                    Ok(()) => self.link.on_transmit_complete(origin, bytes.len()),
                    Err(e) => self.link.on_transmit_failed(origin, &e),
                },
                Action::ArmTimer { key, after } => match self.timer_keys.get(&key) {
                    Some(existing) => self.timers.reset(existing, after),
                    None => {
                        let handle = self.timers.insert(key, after);
                        self.timer_keys.insert(key, handle);
                    }
                },
                Action::CancelTimer(key) => {
                    if let Some(handle) = self.timer_keys.remove(&key) {
                        self.timers.remove(&handle);
                    }
                }
                Action::Event(event) => {
                    if let Err(e) = self.events.try_send(event) {
                        debug!(error = %e, "link event dropped");
                    }
                }
                Action::Close => closed = true,
            }
        }
        closed
    }

    /// Write `bytes` to the transport, feeding whatever the peer sends in the
    /// meantime to the link.
    async fn write_while_reading(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = &mut self.writer;
        let write = with_timeout_error(
            async {
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok::<(), ProtocolError>(())
            },
            self.send_timeout,
        );
        tokio::pin!(write);

        let mut open = true;
        loop {
            self.read_buf.reserve(READ_BUFFER_SIZE);
            tokio::select! {
                result = &mut write => return result,
                read = self.reader.read_buf(&mut self.read_buf), if open => {
                    open = deliver(&mut self.link, &mut self.read_buf, read);
                }
            }
        }
    }
}

/// Hand the outcome of one transport read to `link`. Returns false once the
/// transport is gone.
fn deliver(link: &mut Link, buf: &mut BytesMut, read: std::io::Result<usize>) -> bool {
    match read {
        Ok(0) => {
            link.on_transport_closed();
            false
        }
        Ok(n) => {
            let bytes = buf.split();
            debug!(len = n, "transport read");
            link.on_bytes_received(&bytes);
            true
        }
        Err(e) => {
            warn!(error = %e, "transport read failed");
            link.on_transport_closed();
            false
        }
    }
}
