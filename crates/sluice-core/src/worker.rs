//! The receive worker: drains a transport into an [`IncomingQueue`] and runs
//! periodic housekeeping.

use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::session::{IncomingQueue, IngestOutcome};

/// Datagram transport the worker reads from and sends control frames on.
pub trait Transport: Send + Sync + 'static {
    /// Size of the next datagram, when the transport can tell.
    fn next_packet_size(&self) -> Option<usize> {
        None
    }

    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>>;

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

impl Transport for UdpSocket {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        UdpSocket::poll_recv_from(self, cx, buf)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, buf, target)
    }
}

pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop at its next checkpoint and wait for it.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("receive worker panicked")?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn spawn_worker<T: Transport>(queue: Arc<IncomingQueue>, transport: Arc<T>) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run(queue, transport, shutdown_rx));
    WorkerHandle {
        shutdown: Some(shutdown_tx),
        task,
    }
}

async fn run<T: Transport>(
    queue: Arc<IncomingQueue>,
    transport: Arc<T>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let max_len = queue.config().max_recv_packet_size;
    let mut housekeeping = tokio::time::interval(queue.config().housekeeping_interval());
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // One spare byte so oversize datagrams show up as such instead of
    // silently truncated.
    let mut buf = vec![0u8; max_len + 1];

    info!("receive worker started");
    loop {
        flush_control(&queue, &*transport);

        let hint = transport.next_packet_size();

        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                break;
            }
            result = recv(&*transport, &mut buf) => {
                match result {
                    Ok((len, from)) if len > max_len || hint.is_some_and(|h| h > max_len) => {
                        queue.record_oversize();
                        debug!("oversize datagram from {} dropped", from);
                    }
                    Ok((len, from)) => {
                        let now = Instant::now().into_std();
                        match queue.ingest(buf[..len].to_vec(), from, now) {
                            IngestOutcome::Dropped(reason) => {
                                trace!("datagram from {} dropped: {:?}", from, reason);
                            }
                            outcome => trace!("datagram from {}: {:?}", from, outcome),
                        }
                    }
                    Err(e) => {
                        queue.record_transport_error();
                        warn!("receive failed: {}", e);
                    }
                }
            }
            _ = housekeeping.tick() => {
                let report = queue.housekeeping(Instant::now().into_std());
                if report.removed_sources > 0 || report.expired_packets > 0 {
                    debug!(
                        "housekeeping: {} packets expired, {} sources removed",
                        report.expired_packets, report.removed_sources
                    );
                }
            }
        }
    }
    info!("receive worker stopped");
}

fn recv<'a, T: Transport>(
    transport: &'a T,
    buf: &'a mut [u8],
) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + 'a {
    poll_fn(move |cx| {
        let mut read = ReadBuf::new(&mut *buf);
        match transport.poll_recv_from(cx, &mut read) {
            Poll::Ready(Ok(from)) => Poll::Ready(Ok((read.filled().len(), from))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
}

fn flush_control<T: Transport>(queue: &IncomingQueue, transport: &T) {
    for (peer, frame) in queue.drain_outbound() {
        if let Err(e) = transport.try_send_to(&frame, peer) {
            warn!("failed to send control frame to {}: {}", peer, e);
        }
    }
}
