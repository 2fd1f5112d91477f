//! Transport worker, access delivery and the outbound send API.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::retry::{AckEvent, Delivery, RetryCommand, RetryLoop, Route, Transaction};
use crate::sar::{SarKey, SarOutcome, SarTable};
use crate::upper::{decrypt_access, encrypt_access, KeyUsed, UpperContext};
use bytes::Bytes;
use mesh_network::{NetworkMessage, NetworkSender};
use mesh_storage::KeyStore;
use mesh_wire::address::is_unicast;
use mesh_wire::{
    seq_auth, seq_zero, LowerTransportPdu, NonceType, SegmentAck, Segmenter, MAX_SEG_N,
    MAX_UNSEGMENTED_PDU, SEGMENT_SIZE,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A decrypted, reassembled access PDU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessMessage {
    /// Source element
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Opcode-prefixed access payload
    pub payload: Bytes,
    /// Key that opened the PDU
    pub key: KeyUsed,
    /// Network key the PDU arrived under
    pub net_key_index: u16,
    /// TTL of the (last) network PDU
    pub ttl: u8,
}

/// Receiver of access messages
pub trait AccessHandler: Send + Sync {
    /// Called once per access PDU
    fn on_access_message(&self, msg: AccessMessage);
}

impl AccessHandler for mpsc::UnboundedSender<AccessMessage> {
    fn on_access_message(&self, msg: AccessMessage) {
        if self.send(msg).is_err() {
            debug!("Access queue closed, message dropped");
        }
    }
}

/// Key to seal an outbound access message with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKey {
    /// Application key by global index
    Application(u16),
    /// Device key of the destination node
    RemoteDevice,
    /// This node's own device key
    LocalDevice,
}

/// Per-send options
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// TTL; the configured default when unset
    pub ttl: Option<u8>,
    /// 64-bit TransMIC; segmented sends only
    pub szmic: bool,
}

/// Outcome of a send, possibly still waiting for acknowledgment
#[derive(Debug)]
pub enum DeliveryHandle {
    /// Nothing to wait for
    Done(Delivery),
    /// Segmented transaction in flight
    Pending(oneshot::Receiver<Result<Delivery, TransportError>>),
}

impl DeliveryHandle {
    /// Wait until the transaction is acknowledged, times out or fails
    pub async fn wait(self) -> Result<Delivery, TransportError> {
        match self {
            DeliveryHandle::Done(delivery) => Ok(delivery),
            DeliveryHandle::Pending(rx) => rx.await.map_err(|_| TransportError::Stopped)?,
        }
    }
}

enum Inbox {
    Network(NetworkMessage),
    Expire { key: SarKey, generation: u64 },
}

/// Receive side of the lower and upper transport; owns the reassembly table
pub(crate) struct TransportLayer {
    config: TransportConfig,
    keys: Arc<dyn KeyStore>,
    sender: NetworkSender,
    handler: Arc<dyn AccessHandler>,
    acks: mpsc::UnboundedSender<AckEvent>,
    sar: SarTable,
    expire_tx: mpsc::UnboundedSender<Inbox>,
}

impl TransportLayer {
    async fn run(
        mut self,
        mut network: mpsc::UnboundedReceiver<NetworkMessage>,
        mut expire_rx: mpsc::UnboundedReceiver<Inbox>,
    ) {
        info!("Transport layer started for {:#06x}", self.config.unicast_address);
        loop {
            let event = tokio::select! {
                msg = network.recv() => match msg {
                    Some(msg) => Inbox::Network(msg),
                    None => break,
                },
                Some(event) = expire_rx.recv() => event,
            };
            match event {
                Inbox::Network(msg) => {
                    if let Err(e) = self.handle_network(msg).await {
                        debug!("Transport rx dropped: {}", e);
                    }
                }
                Inbox::Expire { key, generation } => {
                    if self.sar.expire(&key, generation) {
                        trace!("Reassembly {:?} expired", key);
                    }
                }
            }
        }
        info!("Transport layer stopped");
    }

    async fn handle_network(&mut self, msg: NetworkMessage) -> Result<(), TransportError> {
        match LowerTransportPdu::decode(msg.ctl, &msg.plain)? {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper } => {
                let ctx = UpperContext {
                    szmic: false,
                    seq: msg.seq,
                    src: msg.src,
                    dst: msg.dst,
                    iv_index: msg.iv_index,
                };
                let (payload, key) = decrypt_access(self.keys.as_ref(), akf, aid, &ctx, &upper).await?;
                self.deliver(&msg, payload, key);
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                szmic,
                seq_zero,
                seg_o,
                seg_n,
                segment,
            } => {
                let key = SarKey {
                    src: msg.src,
                    dst: msg.dst,
                    seq_auth: seq_auth(msg.seq, seq_zero),
                };
                let outcome = self.sar.insert(key, msg.net_key_index, seg_o, seg_n, &segment)?;
                trace!("Segment {}/{} from {:#06x}: {:?}", seg_o, seg_n, msg.src, outcome);
                match outcome {
                    SarOutcome::Full => {
                        warn!("Reassembly table full, dropping segment from {:#06x}", msg.src);
                    }
                    SarOutcome::Started { block_ack, generation } => {
                        self.arm_timer(key, generation, self.config.sar_incomplete_timeout);
                        self.send_ack(&msg, seq_zero, block_ack).await?;
                    }
                    SarOutcome::Accepted { block_ack } | SarOutcome::Duplicate { block_ack } => {
                        self.send_ack(&msg, seq_zero, block_ack).await?;
                    }
                    SarOutcome::Complete {
                        block_ack,
                        pdu,
                        generation,
                    } => {
                        self.arm_timer(key, generation, self.config.sar_complete_timeout);
                        self.send_ack(&msg, seq_zero, block_ack).await?;
                        let ctx = UpperContext {
                            szmic,
                            seq: key.seq_auth,
                            src: msg.src,
                            dst: msg.dst,
                            iv_index: msg.iv_index,
                        };
                        let (payload, used) = decrypt_access(self.keys.as_ref(), akf, aid, &ctx, &pdu).await?;
                        self.deliver(&msg, payload, used);
                    }
                }
            }
            LowerTransportPdu::SegmentAck(ack) => {
                debug!(
                    "Ack rx from {:#06x} seq_zero={:#06x} block_ack={:#010x} obo={}",
                    msg.src, ack.seq_zero, ack.block_ack, ack.obo
                );
                if self.acks.send(AckEvent { src: msg.src, ack }).is_err() {
                    warn!("Retry loop gone, ack dropped");
                }
            }
            LowerTransportPdu::UnsegmentedControl { opcode, .. }
            | LowerTransportPdu::SegmentedControl { opcode, .. } => {
                debug!("Ignoring control opcode {:#04x} from {:#06x}", opcode, msg.src);
            }
        }
        Ok(())
    }

    fn deliver(&self, msg: &NetworkMessage, payload: Bytes, key: KeyUsed) {
        debug!(
            "Access rx src={:#06x} dst={:#06x} len={} key={:?}",
            msg.src,
            msg.dst,
            payload.len(),
            key
        );
        self.handler.on_access_message(AccessMessage {
            src: msg.src,
            dst: msg.dst,
            payload,
            key,
            net_key_index: msg.net_key_index,
            ttl: msg.ttl,
        });
    }

    fn arm_timer(&self, key: SarKey, generation: u64, after: std::time::Duration) {
        let inbox = self.expire_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Inbox::Expire { key, generation });
        });
    }

    async fn send_ack(&self, msg: &NetworkMessage, seq_zero: u16, block_ack: u32) -> Result<(), TransportError> {
        // group and virtual destinations are never acknowledged
        if !is_unicast(msg.dst) {
            return Ok(());
        }
        let pdu = LowerTransportPdu::SegmentAck(SegmentAck {
            obo: false,
            seq_zero,
            block_ack,
        })
        .encode()?;
        let seq = self.keys.next_sequence_number().await?;
        self.sender
            .send(msg.net_key_index, true, self.config.ack_ttl, seq, msg.src, pdu)
            .await?;
        trace!("Ack tx to {:#06x} block_ack={:#010x}", msg.src, block_ack);
        Ok(())
    }
}

/// Outbound access API of the transport layer
#[derive(Clone)]
pub struct TransportSender {
    config: TransportConfig,
    keys: Arc<dyn KeyStore>,
    sender: NetworkSender,
    commands: mpsc::UnboundedSender<RetryCommand>,
}

impl TransportSender {
    /// Encrypt and send an access payload; segmented when it does not fit one PDU
    pub async fn send_access(
        &self,
        dst: u16,
        key: AccessKey,
        payload: &[u8],
        options: SendOptions,
    ) -> Result<DeliveryHandle, TransportError> {
        let (seal_key, aid, net_key_index, kind) = match key {
            AccessKey::Application(index) => {
                let app = self.keys.application_key(index).await?;
                (app.current.key, Some(app.current.aid), app.net_key_index, NonceType::Application)
            }
            AccessKey::RemoteDevice => {
                let node = self
                    .keys
                    .find_node_by_source(dst)
                    .await?
                    .ok_or_else(|| TransportError::MissingKey(format!("device key of {:#06x}", dst)))?;
                let net_key_index = node
                    .net_keys
                    .first()
                    .copied()
                    .ok_or_else(|| TransportError::MissingKey(format!("network key of {:#06x}", dst)))?;
                (node.device_key, None, net_key_index, NonceType::Device)
            }
            AccessKey::LocalDevice => {
                let own = self
                    .keys
                    .local_device_key()
                    .await?
                    .ok_or_else(|| TransportError::MissingKey("local device key".to_string()))?;
                (own, None, self.config.net_key_index, NonceType::Device)
            }
        };

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let max_len = (MAX_SEG_N as usize + 1) * SEGMENT_SIZE;
        let seq = self.keys.next_sequence_number().await?;
        let iv_index = self.keys.current_iv_index().await?.tx_index();
        let mic = if options.szmic { 8 } else { 4 };
        let segmented = payload.len() + mic > MAX_UNSEGMENTED_PDU;
        if payload.len() + mic > max_len {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }

        let ctx = UpperContext {
            szmic: options.szmic && segmented,
            seq,
            src: self.sender.unicast_address(),
            dst,
            iv_index,
        };
        let upper = encrypt_access(&seal_key, kind, &ctx, payload)?;
        let akf = aid.is_some();
        let aid = aid.unwrap_or(0);

        if !segmented {
            let pdu = LowerTransportPdu::UnsegmentedAccess { akf, aid, upper }.encode()?;
            self.sender.send(net_key_index, false, ttl, seq, dst, pdu).await?;
            return Ok(DeliveryHandle::Done(Delivery::Sent));
        }

        let chunks = Segmenter::new().split(&upper)?;
        let seg_n = (chunks.len() - 1) as u8;
        let mut segments = Vec::with_capacity(chunks.len());
        for (seg_o, segment) in chunks.into_iter().enumerate() {
            segments.push(
                LowerTransportPdu::SegmentedAccess {
                    akf,
                    aid,
                    szmic: ctx.szmic,
                    seq_zero: seq_zero(seq),
                    seg_o: seg_o as u8,
                    seg_n,
                    segment,
                }
                .encode()?,
            );
        }

        let (done, rx) = oneshot::channel();
        let tx = Transaction {
            route: Route {
                dst,
                ttl,
                net_key_index,
                seq_auth: seq,
            },
            seg_n,
            segments,
            done,
        };
        self.commands
            .send(RetryCommand::Start(tx))
            .map_err(|_| TransportError::Stopped)?;
        Ok(DeliveryHandle::Pending(rx))
    }
}

/// Running transport layer
pub struct Transport {
    /// Outbound API
    pub sender: TransportSender,
    workers: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Spawn the receive worker and the retry loop.
    ///
    /// `network` is the upward queue of the network layer; access messages
    /// go to `handler`.
    pub fn start(
        config: TransportConfig,
        keys: Arc<dyn KeyStore>,
        sender: NetworkSender,
        network: mpsc::UnboundedReceiver<NetworkMessage>,
        handler: Arc<dyn AccessHandler>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (expire_tx, expire_rx) = mpsc::unbounded_channel();

        let retry = RetryLoop::new(config.clone(), keys.clone(), sender.clone());
        let retry_worker = tokio::spawn(retry.run(commands_rx, acks_rx));

        let layer = TransportLayer {
            config: config.clone(),
            keys: keys.clone(),
            sender: sender.clone(),
            handler,
            acks: acks_tx,
            sar: SarTable::new(config.max_sar_entries),
            expire_tx,
        };
        let rx_worker = tokio::spawn(layer.run(network, expire_rx));

        Self {
            sender: TransportSender {
                config,
                keys,
                sender,
                commands: commands_tx,
            },
            workers: vec![rx_worker, retry_worker],
        }
    }

    /// Stop both workers; pending sends resolve with `Stopped`
    pub fn shutdown(self) {
        for worker in self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::Key128;
    use mesh_network::unpack_with_key;
    use mesh_storage::{ApplicationKey, IvIndexState, LocalNode, MemoryKeyStore, NetworkKey, Node};
    use mesh_wire::{AdvBearer, Bearer, WireError};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    const IV_INDEX: u32 = 0x1234_5678;
    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const DEV_KEY: &str = "9d6dd0e96eb25dc19a40ed9914f8f03f";
    const ACCESS: &str = "0056341263964771734fbd76e3b40519d1d94a48";

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn key(s: &str) -> Key128 {
        h(s).try_into().unwrap()
    }

    struct Harness {
        keys: Arc<MemoryKeyStore>,
        transport: Transport,
        network_tx: mpsc::UnboundedSender<NetworkMessage>,
        access_rx: mpsc::UnboundedReceiver<AccessMessage>,
        written: Arc<Mutex<Vec<Bytes>>>,
    }

    impl Harness {
        async fn new(own: u16, config: TransportConfig) -> Self {
            let keys = Arc::new(MemoryKeyStore::new(LocalNode {
                unicast_address: own,
                element_count: 1,
                device_key: None,
            }));
            keys.add_network_key(NetworkKey::new(0, key(NET_KEY)).unwrap());
            keys.set_iv_index(IvIndexState {
                index: IV_INDEX,
                updating: false,
            })
            .await;
            // after the IV index, which restarts the counter
            keys.set_sequence(0x3129ab);

            let bearer = Arc::new(AdvBearer::new());
            let written = Arc::new(Mutex::new(Vec::new()));
            let sink = written.clone();
            bearer.set_write_handle(Arc::new(move |frame: Bytes| -> Result<(), WireError> {
                sink.lock().unwrap().push(frame);
                Ok(())
            }));
            bearer.start().unwrap();

            let sender = NetworkSender::new(own, keys.clone(), bearer);
            let (network_tx, network_rx) = mpsc::unbounded_channel();
            let (access_tx, access_rx) = mpsc::unbounded_channel();
            let transport = Transport::start(
                TransportConfig {
                    unicast_address: own,
                    ..config
                },
                keys.clone(),
                sender,
                network_rx,
                Arc::new(access_tx),
            );
            Self {
                keys,
                transport,
                network_tx,
                access_rx,
                written,
            }
        }

        async fn add_node(&self, addr: u16, device_key: Key128) {
            self.keys
                .store_node(Node {
                    uuid: Uuid::from_bytes([addr as u8; 16]),
                    unicast_address: addr,
                    element_count: 1,
                    device_key,
                    net_keys: vec![0],
                    app_keys: vec![],
                    last_seq: None,
                    friend: None,
                })
                .await
                .unwrap();
        }

        /// Network PDUs written so far, without the adv framing
        fn frames(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().iter().map(|f| f[2..].to_vec()).collect()
        }

        fn sent(&self) -> Vec<NetworkMessage> {
            let material = mesh_storage::NetKeyMaterial::derive(key(NET_KEY)).unwrap();
            self.frames()
                .iter()
                .map(|pdu| unpack_with_key(&material, 0, IV_INDEX, pdu).unwrap())
                .collect()
        }

        fn receive(&self, src: u16, dst: u16, seq: u32, ctl: bool, plain: Vec<u8>) {
            self.network_tx
                .send(NetworkMessage {
                    ivi: 0,
                    nid: 0x68,
                    ctl,
                    ttl: 4,
                    seq,
                    src,
                    dst,
                    plain: Bytes::from(plain),
                    iv_index: IV_INDEX,
                    net_key_index: 0,
                })
                .unwrap();
        }

        async fn wait_for_frames(&self, count: usize) {
            while self.written.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn ack(seq_zero: u16, block_ack: u32, obo: bool) -> Vec<u8> {
        LowerTransportPdu::SegmentAck(SegmentAck {
            obo,
            seq_zero,
            block_ack,
        })
        .encode()
        .unwrap()
        .to_vec()
    }

    /// Seal `payload` for 0x1201 with the device key and split it into lower transport PDUs
    fn segments_for(payload: &[u8], seq: u32) -> Vec<Vec<u8>> {
        let ctx = UpperContext {
            szmic: false,
            seq,
            src: 0x0003,
            dst: 0x1201,
            iv_index: IV_INDEX,
        };
        let upper = encrypt_access(&key(DEV_KEY), NonceType::Device, &ctx, payload).unwrap();
        let chunks = Segmenter::new().split(&upper).unwrap();
        let seg_n = (chunks.len() - 1) as u8;
        chunks
            .into_iter()
            .enumerate()
            .map(|(seg_o, segment)| {
                LowerTransportPdu::SegmentedAccess {
                    akf: false,
                    aid: 0,
                    szmic: false,
                    seq_zero: seq_zero(seq),
                    seg_o: seg_o as u8,
                    seg_n,
                    segment,
                }
                .encode()
                .unwrap()
                .to_vec()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_segmented_send_bit_exact_and_acknowledged() {
        let harness = Harness::new(0x0003, TransportConfig::default()).await;
        harness.add_node(0x1201, key(DEV_KEY)).await;

        let handle = harness
            .transport
            .sender
            .send_access(
                0x1201,
                AccessKey::RemoteDevice,
                &h(ACCESS),
                SendOptions {
                    ttl: Some(4),
                    szmic: false,
                },
            )
            .await
            .unwrap();

        harness.wait_for_frames(2).await;
        assert_eq!(
            harness.frames(),
            vec![
                h("68cab5c5348a230afba8c63d4e686364979deaf4fd40961145939cda0e"),
                h("681615b5dd4a846cae0c032bf0746f44f1b8cc8ce5edc57e55beed49c0"),
            ]
        );

        harness.receive(0x1201, 0x0003, 0x000100, true, ack(0x09ab, 0b11, false));
        assert_eq!(
            handle.wait().await.unwrap(),
            Delivery::Acknowledged {
                by: 0x1201,
                obo: false
            }
        );
        harness.transport.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_retry_budget() {
        let harness = Harness::new(0x0003, TransportConfig::default()).await;
        harness.add_node(0x1201, key(DEV_KEY)).await;

        let handle = harness
            .transport
            .sender
            .send_access(0x1201, AccessKey::RemoteDevice, &h(ACCESS), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(handle.wait().await, Err(TransportError::Timeout { dst: 0x1201 }));
        // two segments, one first transmission and three retries each
        assert_eq!(harness.frames().len(), 8);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.frames().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_ack_then_friend_completes() {
        let harness = Harness::new(0x0003, TransportConfig::default()).await;
        harness.add_node(0x1201, key(DEV_KEY)).await;

        let handle = harness
            .transport
            .sender
            .send_access(0x1201, AccessKey::RemoteDevice, &h(ACCESS), SendOptions::default())
            .await
            .unwrap();
        harness.wait_for_frames(2).await;

        // segment 1 missing: it goes out again right away
        harness.receive(0x1201, 0x0003, 0x000100, true, ack(0x09ab, 0b01, false));
        harness.wait_for_frames(3).await;
        let resent = harness.sent().pop().unwrap();
        match LowerTransportPdu::decode(false, &resent.plain).unwrap() {
            LowerTransportPdu::SegmentedAccess { seg_o, seg_n, .. } => assert_eq!((seg_o, seg_n), (1, 1)),
            other => panic!("unexpected {:?}", other),
        }

        // the LPN's friend completes on its behalf
        harness.receive(0x0100, 0x0003, 0x000200, true, ack(0x09ab, 0b11, true));
        assert_eq!(
            handle.wait().await.unwrap(),
            Delivery::Acknowledged { by: 0x0100, obo: true }
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let node = harness.keys.find_node_by_source(0x1201).await.unwrap().unwrap();
        assert_eq!(node.friend, Some(0x0100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_table_cap() {
        let config = TransportConfig {
            max_pending_transactions: 1,
            ..Default::default()
        };
        let harness = Harness::new(0x0003, config).await;
        harness.add_node(0x1201, key(DEV_KEY)).await;

        let _first = harness
            .transport
            .sender
            .send_access(0x1201, AccessKey::RemoteDevice, &h(ACCESS), SendOptions::default())
            .await
            .unwrap();
        let second = harness
            .transport
            .sender
            .send_access(0x1201, AccessKey::RemoteDevice, &h(ACCESS), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(second.wait().await, Err(TransportError::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsegmented_send_needs_key() {
        let harness = Harness::new(0x0003, TransportConfig::default()).await;
        let result = harness
            .transport
            .sender
            .send_access(0x1201, AccessKey::RemoteDevice, &[0x80, 0x08], SendOptions::default())
            .await;
        assert!(matches!(result, Err(TransportError::MissingKey(_))));

        harness.add_node(0x1201, key(DEV_KEY)).await;
        let handle = harness
            .transport
            .sender
            .send_access(0x1201, AccessKey::RemoteDevice, &[0x80, 0x08], SendOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), Delivery::Sent);

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq, 0x3129ab);
        assert_eq!(sent[0].ttl, 7);
        assert_eq!(sent[0].plain[0], 0x00);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassembly_any_order_single_delivery() {
        let payload: Vec<u8> = (0u8..30).collect();
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let mut harness = Harness::new(0x1201, TransportConfig::default()).await;
            harness
                .keys
                .set_local_device_key(0x1201, key(DEV_KEY))
                .await;
            let segments = segments_for(&payload, 0x0100);
            assert_eq!(segments.len(), 3);

            // a duplicate after every segment
            for &seg_o in order.iter() {
                for _ in 0..2 {
                    harness.receive(0x0003, 0x1201, 0x0100 + seg_o as u32, false, segments[seg_o].clone());
                }
            }

            let msg = harness.access_rx.recv().await.unwrap();
            assert_eq!(msg.payload.to_vec(), payload);
            assert_eq!(msg.src, 0x0003);
            assert_eq!(msg.key, KeyUsed::LocalDevice);

            harness.wait_for_frames(6).await;
            let acks: Vec<u32> = harness
                .sent()
                .iter()
                .map(|m| match LowerTransportPdu::decode(m.ctl, &m.plain).unwrap() {
                    LowerTransportPdu::SegmentAck(ack) => {
                        assert_eq!(m.dst, 0x0003);
                        assert_eq!(ack.seq_zero, 0x0100);
                        ack.block_ack
                    }
                    other => panic!("unexpected {:?}", other),
                })
                .collect();
            assert_eq!(acks.len(), 6);
            assert_eq!(acks[5], 0b111);
            // duplicates are acked with the same mask, not re-processed
            assert_eq!(acks[0], acks[1]);

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(harness.access_rx.try_recv().is_err());
            harness.transport.shutdown();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_vector_segments_reassemble() {
        let mut harness = Harness::new(0x1201, TransportConfig::default()).await;
        harness.add_node(0x0003, key(DEV_KEY)).await;

        harness.receive(0x0003, 0x1201, 0x3129ac, false, h("8026ac21cfdc18c52fdef772e0e17308"));
        harness.receive(0x0003, 0x1201, 0x3129ab, false, h("8026ac01ee9dddfd2169326d23f3afdf"));

        let msg = harness.access_rx.recv().await.unwrap();
        assert_eq!(msg.payload.to_vec(), h(ACCESS));
        assert_eq!(msg.key, KeyUsed::Device);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_destination_not_acknowledged() {
        let mut harness = Harness::new(0x0005, TransportConfig::default()).await;
        harness
            .keys
            .add_application_key(ApplicationKey::new(0, 0, key("63964771734fbd76e3b40519d1d94a48")).unwrap());

        // SEG=0 AKF=1 AID=0x26
        let mut lower = vec![0x66];
        lower.extend(h("5a8bde6d9106ea078a"));
        harness.receive(0x1201, 0xffff, 7, false, lower);

        let msg = harness.access_rx.recv().await.unwrap();
        assert_eq!(msg.payload.to_vec(), h("0400000000"));
        assert_eq!(msg.src, 0x1201);
        assert_eq!(msg.key, KeyUsed::Application(0));

        let segments = segments_for(&[7u8; 20], 0x0200);
        for (i, segment) in segments.into_iter().enumerate() {
            harness.receive(0x0003, 0xc000, 0x0200 + i as u32, false, segment);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_entry_expires() {
        let mut harness = Harness::new(0x1201, TransportConfig::default()).await;
        harness.add_node(0x0003, key(DEV_KEY)).await;
        let first = h("8026ac01ee9dddfd2169326d23f3afdf");
        let second = h("8026ac21cfdc18c52fdef772e0e17308");

        harness.receive(0x0003, 0x1201, 0x3129ab, false, first.clone());
        harness.receive(0x0003, 0x1201, 0x3129ac, false, second.clone());
        harness.access_rx.recv().await.unwrap();

        // swallowed while the completed entry lives
        harness.receive(0x0003, 0x1201, 0x3129ab, false, first.clone());
        harness.receive(0x0003, 0x1201, 0x3129ac, false, second.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(harness.access_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        harness.receive(0x0003, 0x1201, 0x3129ab, false, first);
        harness.receive(0x0003, 0x1201, 0x3129ac, false, second);
        assert_eq!(harness.access_rx.recv().await.unwrap().payload.to_vec(), h(ACCESS));
    }
}
