use crate::prelude::*;

use crate::envertech::frame::{self, Serial};
use crate::envertech::telemetry::{self, ParsedReply};

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::sync::Arc,
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    tokio::net::TcpStream,
    tokio::sync::{mpsc, Mutex},
    tokio::task::JoinHandle,
    tokio::time::{sleep, timeout},
    tokio_util::sync::CancellationToken,
};

pub const DEFAULT_PORT: u16 = 14889;

const RECV_BUFFER_SIZE: usize = 1024;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60; // TCP keepalive interval
const EXCHANGE_ATTEMPTS: usize = 5;
const RETRY_BACKOFF_MS: u64 = 500; // delay before re-sending the data request
const STREAM_READ_TIMEOUT_SECS: u64 = 1; // per-read timeout of the stream receiver
const TEARDOWN_TIMEOUT_MS: u64 = 500;

/// One TCP session to one gateway: connect, send command frames, receive
/// raw replies, and always part with a break command.
pub struct InverterClient {
    host: String,
    port: u16,
    serial: Serial,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
}

impl InverterClient {
    pub fn new(host: impl Into<String>, port: u16, serial: Serial) -> Self {
        Self {
            host: host.into(),
            port,
            serial,
            reader: None,
            writer: None,
        }
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        let stream = match timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect((self.host.clone(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => bail!("failed to connect to {}:{}: {}", self.host, self.port, e),
            Err(_) => bail!(
                "connection to {}:{} timed out after {}s",
                self.host,
                self.port,
                CONNECT_TIMEOUT_SECS
            ),
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("failed to set TCP keepalive: {}", e);
        }
        let stream = TcpStream::from_std(std_stream)?;

        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);

        info!(
            "connected to inverter {} at {}:{}",
            self.serial, self.host, self.port
        );
        Ok(())
    }

    /// Write a command frame. An empty frame means a build failure upstream;
    /// it is dropped with a diagnostic rather than sent as garbage. Connects
    /// first if no connection exists.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.is_empty() {
            error!("refusing to send empty frame to inverter {}", self.serial);
            return Ok(());
        }
        if self.writer.is_none() {
            self.connect().await?;
        }
        let Some(writer) = self.writer.as_mut() else {
            bail!("no connection to inverter {}", self.serial);
        };
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one reply of up to 1024 bytes. Timeout expiry is "no data this
    /// cycle" (`Ok(None)`), never an error; any other I/O failure, including
    /// the peer closing the connection, propagates.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let Some(reader) = self.reader.as_mut() else {
            bail!("receive called while disconnected from {}", self.serial);
        };
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        match timeout(wait, reader.read_buf(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => bail!("connection closed by peer"),
            Ok(Ok(_)) => Ok(Some(buf.to_vec())),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Best-effort break command, then close. The close happens even when
    /// the break command cannot be sent.
    pub async fn disconnect(&mut self) {
        if self.writer.is_some() {
            let break_frame = frame::build_break_command(&self.serial);
            if let Err(e) = self.send(&break_frame).await {
                warn!("break command to inverter {} failed: {}", self.serial, e);
            }
        }
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            info!("disconnected from inverter {}", self.serial);
        }
    }

    /// One-shot exchange: connect, request, poll for a usable reply with
    /// retries, and part cleanly whatever happens. Retries exhausted is not
    /// an error; the caller gets an empty reply.
    pub async fn get_inverter_data(&mut self, receive_timeout: Duration) -> Result<ParsedReply> {
        let result = self.exchange(receive_timeout).await;
        // break + close must run on every exit path
        self.disconnect().await;
        result
    }

    async fn exchange(&mut self, receive_timeout: Duration) -> Result<ParsedReply> {
        if self.writer.is_none() {
            self.connect().await?;
        }
        self.send(&frame::build_data_request(&self.serial)).await?;

        for attempt in 1..=EXCHANGE_ATTEMPTS {
            if let Some(raw) = self.receive(receive_timeout).await? {
                let reply = telemetry::parse(&raw);
                if reply.is_usable() {
                    return Ok(reply);
                }
                debug!(
                    "inverter {}: attempt {}: reply not usable (control code {:?})",
                    self.serial, attempt, reply.control_code
                );
            }
            if attempt < EXCHANGE_ATTEMPTS {
                sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                self.send(&frame::build_data_request(&self.serial)).await?;
            }
        }

        Ok(ParsedReply::default())
    }

    /// Continuous polling: a periodic sender re-issues the data request
    /// every `interval` while a receiver forwards every non-empty read into
    /// an unbounded queue the returned stream consumes. Consumes the client;
    /// the stream owns the connection from here on.
    pub async fn stream(
        mut self,
        interval: Duration,
        pull_timeout: Duration,
    ) -> Result<TelemetryStream> {
        if self.writer.is_none() {
            self.connect().await?;
        }
        let (Some(reader), Some(writer)) = (self.reader.take(), self.writer.take()) else {
            bail!("connection missing after connect to {}", self.serial);
        };

        let writer = Arc::new(Mutex::new(Some(writer)));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let sender_task = spawn_sender(
            self.serial,
            interval,
            writer.clone(),
            tx.clone(),
            cancel.clone(),
        );
        let receiver_task = spawn_receiver(self.serial, reader, tx, cancel.clone());

        Ok(TelemetryStream {
            serial: self.serial,
            rx,
            pull_timeout,
            writer,
            cancel,
            sender_task,
            receiver_task,
            finished: false,
        })
    }
}

enum QueueItem {
    Raw(Vec<u8>),
    Failed(String),
}

fn spawn_sender(
    serial: Serial,
    interval: Duration,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    tx: mpsc::UnboundedSender<QueueItem>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let request = frame::build_data_request(&serial);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut guard = writer.lock().await;
                    let Some(w) = guard.as_mut() else { break };
                    let sent: std::io::Result<()> = async {
                        w.write_all(&request).await?;
                        w.flush().await
                    }
                    .await;
                    if let Err(e) = sent {
                        let _ = tx.send(QueueItem::Failed(format!("sender failed: {}", e)));
                        break;
                    }
                    debug!("inverter {}: data request sent", serial);
                }
            }
        }
        debug!("inverter {}: sender exiting", serial);
    })
}

fn spawn_receiver(
    serial: Serial,
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<QueueItem>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = timeout(
                    Duration::from_secs(STREAM_READ_TIMEOUT_SECS),
                    reader.read_buf(&mut buf),
                ) => match read {
                    Err(_) => continue, // stalled socket, keep polling
                    Ok(Ok(0)) => {
                        let _ = tx.send(QueueItem::Failed("connection closed by peer".to_string()));
                        break;
                    }
                    Ok(Ok(_)) => {
                        let _ = tx.send(QueueItem::Raw(buf.to_vec()));
                    }
                    Ok(Err(e)) => {
                        let _ = tx.send(QueueItem::Failed(format!("receiver failed: {}", e)));
                        break;
                    }
                }
            }
        }
        debug!("inverter {}: receiver exiting", serial);
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A reply pulled off the queue and parsed; yielded even when the parse
    /// legitimately produced nothing (ack or unrecognized code).
    Reply(ParsedReply),
    /// Nothing arrived within the pull timeout; the stream is still live.
    Idle,
    /// The sender or receiver failed; the stream has been torn down.
    Failed(String),
}

/// Consumer side of a streaming exchange. Pull events with [`next`]; the
/// stream ends after a [`StreamEvent::Failed`] and tears the session down
/// itself. Dropping the stream cancels both background tasks.
///
/// [`next`]: TelemetryStream::next
pub struct TelemetryStream {
    serial: Serial,
    rx: mpsc::UnboundedReceiver<QueueItem>,
    pull_timeout: Duration,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    cancel: CancellationToken,
    sender_task: JoinHandle<()>,
    receiver_task: JoinHandle<()>,
    finished: bool,
}

impl TelemetryStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match timeout(self.pull_timeout, self.rx.recv()).await {
            Err(_) => Some(StreamEvent::Idle),
            Ok(Some(QueueItem::Raw(raw))) => Some(StreamEvent::Reply(telemetry::parse(&raw))),
            Ok(Some(QueueItem::Failed(message))) => {
                error!("inverter {}: stream failed: {}", self.serial, message);
                self.finished = true;
                self.close().await;
                Some(StreamEvent::Failed(message))
            }
            Ok(None) => {
                self.finished = true;
                self.close().await;
                None
            }
        }
    }

    /// Cancel both background tasks without waiting on them, then
    /// best-effort break command and socket close under a short timeout.
    /// Idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.sender_task.abort();
        self.receiver_task.abort();

        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let break_frame = frame::build_break_command(&self.serial);
            let teardown = async {
                if let Err(e) = writer.write_all(&break_frame).await {
                    warn!("break command to inverter {} failed: {}", self.serial, e);
                }
                let _ = writer.shutdown().await;
            };
            let _ = timeout(Duration::from_millis(TEARDOWN_TIMEOUT_MS), teardown).await;
            info!("stream to inverter {} closed", self.serial);
        }
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.sender_task.abort();
        self.receiver_task.abort();
    }
}
