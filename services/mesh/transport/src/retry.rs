//! Retransmission of outbound segmented transactions.
//!
//! A single task owns every pending transaction. It reacts to whichever
//! comes first: a new transaction, an incoming segment acknowledgment, or
//! the poll tick that retransmits segments whose ack deadline elapsed.

use crate::config::TransportConfig;
use crate::error::TransportError;
use bytes::Bytes;
use mesh_network::NetworkSender;
use mesh_storage::{KeyStore, StorageError};
use mesh_wire::address::is_unicast;
use mesh_wire::{full_block_mask, seq_zero, SegmentAck};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How an access message left this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// Sent without acknowledgment (unsegmented, or to a group)
    Sent,
    /// Every segment acknowledged
    Acknowledged {
        /// Address that sent the completing ack
        by: u16,
        /// Ack came from a Friend on behalf of the destination
        obo: bool,
    },
}

/// A segment acknowledgment as seen by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEvent {
    /// Source of the ack
    pub src: u16,
    /// Ack body
    pub ack: SegmentAck,
}

pub(crate) type Completion = oneshot::Sender<Result<Delivery, TransportError>>;

/// Where and how the segments of one transaction are sent
#[derive(Debug, Clone, Copy)]
pub(crate) struct Route {
    pub dst: u16,
    pub ttl: u8,
    pub net_key_index: u16,
    pub seq_auth: u32,
}

/// A segmented transaction handed to the retry loop
pub(crate) struct Transaction {
    pub route: Route,
    pub seg_n: u8,
    pub segments: Vec<Bytes>,
    pub done: Completion,
}

pub(crate) enum RetryCommand {
    Start(Transaction),
}

struct PendingSegment {
    seg_o: u8,
    pdu: Bytes,
    transmissions_left: u8,
    deadline: Instant,
    sent: bool,
    acked: bool,
}

struct Pending {
    route: Route,
    seq_zero: u16,
    full_mask: u32,
    segments: Vec<PendingSegment>,
    done: Option<Completion>,
}

impl Pending {
    fn matches(&self, ev: &AckEvent) -> bool {
        ev.ack.seq_zero == self.seq_zero && (ev.src == self.route.dst || ev.ack.obo)
    }

    fn finish(&mut self, result: Result<Delivery, TransportError>) {
        if let Some(done) = self.done.take() {
            // caller may have given up waiting
            let _ = done.send(result);
        }
    }
}

pub(crate) struct RetryLoop {
    config: TransportConfig,
    keys: Arc<dyn KeyStore>,
    sender: NetworkSender,
    pending: HashMap<u64, Pending>,
    next_id: u64,
}

async fn transmit(
    keys: &dyn KeyStore,
    sender: &NetworkSender,
    route: Route,
    seg: &mut PendingSegment,
    ack_timeout: Duration,
) -> Result<(), StorageError> {
    // the first transmission of segment 0 carries SeqAuth itself
    let seq = if seg.seg_o == 0 && !seg.sent {
        route.seq_auth
    } else {
        keys.next_sequence_number().await?
    };
    seg.sent = true;
    seg.transmissions_left = seg.transmissions_left.saturating_sub(1);
    seg.deadline = Instant::now() + ack_timeout;
    if let Err(e) = sender
        .send(route.net_key_index, false, route.ttl, seq, route.dst, seg.pdu.clone())
        .await
    {
        warn!("Segment {} to {:#06x} not sent: {}", seg.seg_o, route.dst, e);
    }
    Ok(())
}

impl RetryLoop {
    pub(crate) fn new(config: TransportConfig, keys: Arc<dyn KeyStore>, sender: NetworkSender) -> Self {
        Self {
            config,
            keys,
            sender,
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RetryCommand>,
        mut acks: mpsc::UnboundedReceiver<AckEvent>,
    ) {
        let mut tick = tokio::time::interval(self.config.retry_poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Transport retry loop started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RetryCommand::Start(tx)) => self.start(tx).await,
                    None => break,
                },
                Some(ack) = acks.recv() => self.on_ack(ack).await,
                _ = tick.tick() => self.service().await,
            }
        }

        for (_, mut tx) in self.pending.drain() {
            tx.finish(Err(TransportError::Stopped));
        }
        info!("Transport retry loop stopped");
    }

    async fn start(&mut self, tx: Transaction) {
        if self.pending.len() >= self.config.max_pending_transactions {
            warn!(
                "Pending transaction table full, rejecting send to {:#06x}",
                tx.route.dst
            );
            let _ = tx.done.send(Err(TransportError::Busy));
            return;
        }

        let now = Instant::now();
        let transmissions = self.config.retries.saturating_add(1);
        let segments = tx
            .segments
            .into_iter()
            .enumerate()
            .map(|(i, pdu)| PendingSegment {
                seg_o: i as u8,
                pdu,
                transmissions_left: transmissions,
                deadline: now + self.config.segment_stagger * i as u32,
                sent: false,
                acked: false,
            })
            .collect();

        self.next_id += 1;
        let seq_zero = seq_zero(tx.route.seq_auth);
        debug!(
            "Segmented tx to {:#06x} seq_zero={:#06x} seg_n={}",
            tx.route.dst, seq_zero, tx.seg_n
        );
        self.pending.insert(
            self.next_id,
            Pending {
                route: tx.route,
                seq_zero,
                full_mask: full_block_mask(tx.seg_n),
                segments,
                done: Some(tx.done),
            },
        );
        self.service().await;
    }

    async fn on_ack(&mut self, ev: AckEvent) {
        let Some(id) = self
            .pending
            .iter()
            .find(|(_, tx)| tx.matches(&ev))
            .map(|(id, _)| *id)
        else {
            debug!(
                "Unmatched ack from {:#06x} seq_zero={:#06x}",
                ev.src, ev.ack.seq_zero
            );
            return;
        };
        let Some(tx) = self.pending.get_mut(&id) else {
            return;
        };

        for seg in tx.segments.iter_mut() {
            if ev.ack.block_ack & (1 << seg.seg_o) != 0 {
                seg.acked = true;
            }
        }

        if ev.ack.block_ack & tx.full_mask == tx.full_mask {
            let dst = tx.route.dst;
            debug!(
                "Transaction to {:#06x} acknowledged by {:#06x} obo={}",
                dst, ev.src, ev.ack.obo
            );
            tx.finish(Ok(Delivery::Acknowledged {
                by: ev.src,
                obo: ev.ack.obo,
            }));
            self.pending.remove(&id);
            if ev.ack.obo && ev.src != dst {
                if let Err(e) = self.keys.set_friend(dst, Some(ev.src)).await {
                    debug!("Friend of {:#06x} not recorded: {}", dst, e);
                }
            }
            return;
        }

        // resend what the peer is missing among segments already on the air
        let route = tx.route;
        let ack_timeout = self.config.ack_timeout(route.ttl);
        for seg in tx
            .segments
            .iter_mut()
            .filter(|s| s.sent && !s.acked && s.transmissions_left > 0)
        {
            if let Err(e) = transmit(self.keys.as_ref(), &self.sender, route, seg, ack_timeout).await {
                warn!("Retransmission aborted: {}", e);
                return;
            }
        }
    }

    async fn service(&mut self) {
        let now = Instant::now();
        let first_transmission = self.config.retries.saturating_add(1);
        let mut finished = Vec::new();

        for (&id, tx) in self.pending.iter_mut() {
            let route = tx.route;
            let ack_timeout = self.config.ack_timeout(route.ttl);
            let mut exhausted = false;
            let mut failed = None;

            for seg in tx.segments.iter_mut() {
                if seg.acked || now < seg.deadline {
                    continue;
                }
                if seg.transmissions_left == 0 {
                    exhausted = true;
                    continue;
                }
                if seg.transmissions_left < first_transmission {
                    debug!("Ack timeout, resending segment {} to {:#06x}", seg.seg_o, route.dst);
                }
                if let Err(e) = transmit(self.keys.as_ref(), &self.sender, route, seg, ack_timeout).await {
                    failed = Some(e);
                    break;
                }
            }

            if let Some(e) = failed {
                tx.finish(Err(e.into()));
                finished.push(id);
            } else if exhausted {
                if is_unicast(route.dst) {
                    warn!("Segmented tx to {:#06x} timed out", route.dst);
                    tx.finish(Err(TransportError::Timeout { dst: route.dst }));
                    finished.push(id);
                } else if tx
                    .segments
                    .iter()
                    .all(|s| s.transmissions_left == 0 && now >= s.deadline)
                {
                    // groups never acknowledge; the budget is the delivery
                    tx.finish(Ok(Delivery::Sent));
                    finished.push(id);
                }
            }
        }

        for id in finished {
            self.pending.remove(&id);
        }
    }
}
