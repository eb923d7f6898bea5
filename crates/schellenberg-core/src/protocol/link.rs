//! Serial link actor
//!
//! One spawned task owns the serial stream, a line codec, and the
//! request/response correlation state. Everything else talks to it through
//! channels: an mpsc channel for outbound commands, a broadcast channel for
//! decoded inbound frames, and a watch channel for connection status. This
//! keeps writes serialized and correlation free of shared-state races.
//!
//! Commands and asynchronous events arrive interleaved on the same wire and
//! are distinguished only by line shape (see [`super::frame`]). The actor
//! holds at most one in-flight command; a frame matching its expected reply
//! kind completes it, every decoded frame is broadcast to subscribers either
//! way. Further requests wait their turn in the command channel, so commands
//! are strictly FIFO and acknowledgements can never be attributed to the
//! wrong command.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::frame::Frame;
use super::{Error, Result, MAX_LINE_LEN, QUERY_TIMEOUT, TRANSMIT_TIMEOUT, VERIFY_TIMEOUT};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Operating mode of the stick / driver session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    /// B:0 firmware update mode
    Bootloader,
    /// B:1, powered up, radio idle
    Initial,
    /// B:2, receiving radio traffic (normal operation)
    Listening,
    /// A pairing session is active
    Pairing,
    /// A calibration phase is active
    Calibrating,
}

/// Connection health, published through a watch channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the serial link is up
    pub is_connected: bool,
    /// Current operating mode
    pub device_mode: DeviceMode,
    /// Description of the fault that ended the last session, if any
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn connected() -> Self {
        Self {
            is_connected: true,
            device_mode: DeviceMode::Initial,
            last_error: None,
        }
    }
}

/// Event published to broadcast subscribers
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A decoded inbound line (acknowledgements included)
    Frame(Frame),
    /// The link shut down; no further frames will arrive
    Closed,
}

/// Reply kind a command correlates against.
///
/// Classification of inbound lines is by shape alone, so a delayed `t1`
/// can only ever complete a transmit-kind command and a device event can
/// never complete anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpectedReply {
    /// Fire-and-forget; resolves as soon as the write completes
    None,
    /// `t1`/`t0` (or `tE`, surfaced as [`Error::StickBusy`])
    TransmitAck,
    /// `sr<id>` stick id response
    StickId,
    /// `RFTU_...` verify response
    Verify,
}

impl ExpectedReply {
    fn matches(&self, frame: &Frame) -> bool {
        match self {
            ExpectedReply::None => false,
            ExpectedReply::TransmitAck => matches!(frame, Frame::TransmitAck { .. }),
            ExpectedReply::StickId => matches!(frame, Frame::StickId { .. }),
            ExpectedReply::Verify => matches!(frame, Frame::Verify { .. }),
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            ExpectedReply::None => Duration::ZERO,
            ExpectedReply::TransmitAck => TRANSMIT_TIMEOUT,
            ExpectedReply::StickId => QUERY_TIMEOUT,
            ExpectedReply::Verify => VERIFY_TIMEOUT,
        }
    }
}

/// Request sent into the link task
pub(crate) enum LinkRequest {
    /// Write a line and optionally await its correlated reply
    Send {
        line: String,
        expect: ExpectedReply,
        reply: oneshot::Sender<Result<Option<Frame>>>,
    },
    /// Update the published device mode
    SetMode(DeviceMode),
    /// Close the link cleanly
    Shutdown,
}

struct PendingReply {
    expect: ExpectedReply,
    reply: oneshot::Sender<Result<Option<Frame>>>,
    deadline: Instant,
}

/// Cloneable handle to the link task
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::Sender<LinkRequest>,
    events_tx: broadcast::Sender<LinkEvent>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl LinkHandle {
    /// Write a line and await the correlated reply (or write completion
    /// for fire-and-forget commands).
    pub(crate) async fn request(
        &self,
        line: String,
        expect: ExpectedReply,
    ) -> Result<Option<Frame>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkRequest::Send {
                line,
                expect,
                reply: tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    pub(crate) async fn set_mode(&self, mode: DeviceMode) {
        let _ = self.cmd_tx.send(LinkRequest::SetMode(mode)).await;
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.cmd_tx.send(LinkRequest::Shutdown).await;
    }

    /// Subscribe to decoded inbound frames
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    /// Watch connection status changes
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Current connection state
    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().is_connected
    }
}

/// Spawn the link task over an already-open stream.
///
/// The stream seam is generic so tests can substitute an in-memory duplex
/// pipe for the serial port.
pub(crate) fn spawn<S>(stream: S) -> LinkHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::connected());

    tokio::spawn(link_task(stream, cmd_rx, events_tx.clone(), status_tx));

    LinkHandle {
        cmd_tx,
        events_tx,
        status_rx,
    }
}

async fn link_task<S>(
    stream: S,
    mut cmd_rx: mpsc::Receiver<LinkRequest>,
    events_tx: broadcast::Sender<LinkEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut pending: Option<PendingReply> = None;

    let fault: Option<String> = loop {
        // Far-future placeholder keeps the select arm inert while nothing
        // is in flight.
        let deadline = pending
            .as_ref()
            .map(|p| p.deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            req = cmd_rx.recv(), if pending.is_none() => {
                match req {
                    Some(LinkRequest::Send { line, expect, reply }) => {
                        debug!(command = %line, "writing to stick");
                        // LinesCodec appends '\n'; the stick wants CRLF.
                        if let Err(e) = framed.send(format!("{line}\r")).await {
                            let msg = e.to_string();
                            let _ = reply.send(Err(codec_error(e)));
                            break Some(msg);
                        }
                        match expect {
                            ExpectedReply::None => {
                                let _ = reply.send(Ok(None));
                            }
                            _ => {
                                pending = Some(PendingReply {
                                    deadline: Instant::now() + expect.timeout(),
                                    expect,
                                    reply,
                                });
                            }
                        }
                    }
                    Some(LinkRequest::SetMode(mode)) => {
                        status_tx.send_modify(|s| s.device_mode = mode);
                    }
                    Some(LinkRequest::Shutdown) | None => {
                        info!("link shutting down");
                        break None;
                    }
                }
            }

            read = framed.next() => {
                match read {
                    Some(Ok(raw)) => {
                        let line = raw.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let frame = Frame::parse(line);
                        if let Frame::Unknown { .. } = frame {
                            debug!(line, "unrecognized line");
                        }
                        let _ = events_tx.send(LinkEvent::Frame(frame.clone()));
                        pending = correlate(pending, frame);
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // A single bad line must not end the session.
                        warn!("discarding oversized line");
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        warn!(error = %e, "serial read failed");
                        break Some(e.to_string());
                    }
                    None => {
                        warn!("serial stream closed");
                        break Some("stream closed".to_string());
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                if let Some(p) = pending.take() {
                    warn!("command timed out awaiting {:?}", p.expect);
                    let _ = p.reply.send(Err(Error::CommandTimeout));
                }
            }
        }
    };

    // Fail the in-flight command and everything still queued, then notify
    // subscribers exactly once.
    if let Some(p) = pending.take() {
        let _ = p.reply.send(Err(Error::ConnectionLost));
    }
    cmd_rx.close();
    while let Ok(req) = cmd_rx.try_recv() {
        if let LinkRequest::Send { reply, .. } = req {
            let _ = reply.send(Err(Error::ConnectionLost));
        }
    }
    status_tx.send_modify(|s| {
        s.is_connected = false;
        s.last_error = fault;
    });
    let _ = events_tx.send(LinkEvent::Closed);
}

/// Match an inbound frame against the pending command, if any.
///
/// Returns the still-pending command when the frame was unrelated.
fn correlate(pending: Option<PendingReply>, frame: Frame) -> Option<PendingReply> {
    let p = pending?;
    if matches!(frame, Frame::TransmitBusy) && p.expect == ExpectedReply::TransmitAck {
        let _ = p.reply.send(Err(Error::StickBusy));
        None
    } else if p.expect.matches(&frame) {
        let _ = p.reply.send(Ok(Some(frame)));
        None
    } else {
        Some(p)
    }
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => Error::MalformedFrame("line too long".into()),
        LinesCodecError::Io(e) => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::DeviceEnum;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn link_pair() -> (LinkHandle, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        (spawn(ours), theirs)
    }

    async fn read_line(stick: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stick.read_exact(&mut byte).await.expect("read");
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8(buf).expect("ascii")
    }

    #[tokio::test]
    async fn test_transmit_ack_correlation() {
        let (link, mut stick) = link_pair();

        let req = tokio::spawn({
            let link = link.clone();
            async move {
                link.request("ss109010000".into(), ExpectedReply::TransmitAck)
                    .await
            }
        });

        assert_eq!(read_line(&mut stick).await, "ss109010000\r");
        stick.write_all(b"t1\r\n").await.expect("write");

        let frame = req.await.expect("join").expect("result");
        assert_eq!(frame, Some(Frame::TransmitAck { accepted: true }));
    }

    #[tokio::test]
    async fn test_fire_and_forget_resolves_on_write() {
        let (link, mut stick) = link_pair();

        let res = link.request("so+".into(), ExpectedReply::None).await;
        assert!(matches!(res, Ok(None)));
        assert_eq!(read_line(&mut stick).await, "so+\r");
    }

    #[tokio::test]
    async fn test_commands_are_fifo_queued() {
        let (link, mut stick) = link_pair();

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.request("sr".into(), ExpectedReply::StickId).await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let link = link.clone();
            async move {
                link.request("ss109000000".into(), ExpectedReply::TransmitAck)
                    .await
            }
        });

        // Only the first command may be on the wire until its reply lands.
        assert_eq!(read_line(&mut stick).await, "sr\r");
        stick.write_all(b"sr5D3E7C\r\n").await.expect("write");
        assert!(matches!(
            first.await.expect("join").expect("result"),
            Some(Frame::StickId { .. })
        ));

        assert_eq!(read_line(&mut stick).await, "ss109000000\r");
        stick.write_all(b"t1\r\n").await.expect("write");
        assert!(matches!(
            second.await.expect("join").expect("result"),
            Some(Frame::TransmitAck { accepted: true })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let (link, mut stick) = link_pair();

        let req = tokio::spawn({
            let link = link.clone();
            async move {
                link.request("ss109010000".into(), ExpectedReply::TransmitAck)
                    .await
            }
        });

        // Consume the write but never answer; the paused clock auto-advances
        // past the transmit deadline.
        assert_eq!(read_line(&mut stick).await, "ss109010000\r");
        let res = req.await.expect("join");
        assert!(matches!(res, Err(Error::CommandTimeout)));

        // The link itself stays healthy.
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_busy_reply_is_an_error_not_a_retry() {
        let (link, mut stick) = link_pair();

        let req = tokio::spawn({
            let link = link.clone();
            async move {
                link.request("ss109010000".into(), ExpectedReply::TransmitAck)
                    .await
            }
        });

        assert_eq!(read_line(&mut stick).await, "ss109010000\r");
        stick.write_all(b"tE\r\n").await.expect("write");

        let res = req.await.expect("join");
        assert!(matches!(res, Err(Error::StickBusy)));

        // Nothing further may appear on the wire: no automatic retry.
        stick.write_all(b"t1\r\n").await.expect("write");
        tokio::task::yield_now().await;
        let mut probe = [0u8; 1];
        let pending_read = tokio::time::timeout(
            Duration::from_millis(50),
            stick.read_exact(&mut probe),
        )
        .await;
        assert!(pending_read.is_err(), "link retried a busy command");
    }

    #[tokio::test]
    async fn test_unsolicited_event_broadcast() {
        let (link, mut stick) = link_pair();
        let mut events = link.subscribe();

        stick
            .write_all(b"ss105D3E7C000101002F\r\n")
            .await
            .expect("write");

        match events.recv().await.expect("event") {
            LinkEvent::Frame(Frame::DeviceEvent {
                device_enum,
                device_id,
                code,
            }) => {
                assert_eq!(device_enum, DeviceEnum(0x10));
                assert_eq!(device_id, "5D3E7C");
                assert_eq!(code, "01");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unrelated_frames_do_not_complete_pending_command() {
        let (link, mut stick) = link_pair();

        let req = tokio::spawn({
            let link = link.clone();
            async move { link.request("sr".into(), ExpectedReply::StickId).await }
        });

        assert_eq!(read_line(&mut stick).await, "sr\r");
        // A device event and a stray verify must not satisfy the sr query.
        stick
            .write_all(b"ss105D3E7C000100002F\r\nsrABCDEF\r\n")
            .await
            .expect("write");

        let frame = req.await.expect("join").expect("result");
        assert_eq!(
            frame,
            Some(Frame::StickId {
                id: "ABCDEF".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_connection_loss_drains_all_pending_commands() {
        let (link, mut stick) = link_pair();
        let mut status = link.status();
        let mut events = link.subscribe();

        let spawn_cmd = |line: &str| {
            let link = link.clone();
            let line = line.to_string();
            tokio::spawn(async move { link.request(line, ExpectedReply::TransmitAck).await })
        };
        let a = spawn_cmd("ss109010000");
        tokio::task::yield_now().await;
        let b = spawn_cmd("ss109020000");
        tokio::task::yield_now().await;
        let c = spawn_cmd("ss109000000");

        // First command reaches the wire, the rest sit in the queue.
        assert_eq!(read_line(&mut stick).await, "ss109010000\r");
        drop(stick);

        for task in [a, b, c] {
            let res = task.await.expect("join");
            assert!(matches!(res, Err(Error::ConnectionLost)), "got {res:?}");
        }

        // Exactly one disconnect notification.
        status.changed().await.expect("status change");
        let snapshot = status.borrow_and_update().clone();
        assert!(!snapshot.is_connected);
        assert!(snapshot.last_error.is_some());
        // No second notification, whether or not the sender is gone yet.
        assert!(!status.has_changed().unwrap_or(false));

        // Subscribers observe the closure.
        loop {
            match events.recv().await.expect("event") {
                LinkEvent::Closed => break,
                LinkEvent::Frame(_) => continue,
            }
        }

        // Late callers get a clean NotConnected.
        let res = link.request("sr".into(), ExpectedReply::StickId).await;
        assert!(matches!(res, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_set_mode_updates_status() {
        let (link, _stick) = link_pair();
        link.set_mode(DeviceMode::Listening).await;

        let mut status = link.status();
        let mode = loop {
            let snapshot = status.borrow_and_update().clone();
            if snapshot.device_mode == DeviceMode::Listening {
                break snapshot.device_mode;
            }
            status.changed().await.expect("status change");
        };
        assert_eq!(mode, DeviceMode::Listening);
    }
}
