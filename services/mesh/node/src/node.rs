//! Node composition: bearer, network, transport and the access dispatcher.

use crate::access::{
    split_opcode, AccessPdu, AppKeyAdd, AppKeyStatus, CompositionData, CompositionDataGet, Message,
    ModelAppBind, ModelAppStatus, ModelId, Opcode, STATUS_SUCCESS,
};
use crate::error::NodeError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_network::{NetworkConfig, NetworkLayer, NetworkSender};
use mesh_provision::{Provisioner, ProvisionerConfig};
use mesh_storage::{KeyStore, Node, StorageError};
use mesh_transport::{
    AccessHandler, AccessKey, AccessMessage, Delivery, DeliveryHandle, KeyUsed, SendOptions, Transport,
    TransportConfig, TransportSender,
};
use mesh_wire::{Bearer, PduKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings of every layer of one node
#[derive(Debug, Clone)]
pub struct MeshNodeConfig {
    /// Primary unicast address; overrides the per-layer addresses
    pub unicast_address: u16,
    /// Network layer
    pub network: NetworkConfig,
    /// Lower and upper transport
    pub transport: TransportConfig,
    /// Provisioner role
    pub provisioner: ProvisionerConfig,
    /// Wait for the response to a request
    pub response_timeout: Duration,
}

impl Default for MeshNodeConfig {
    fn default() -> Self {
        Self {
            unicast_address: 0x0001,
            network: NetworkConfig::default(),
            transport: TransportConfig::default(),
            provisioner: ProvisionerConfig::default(),
            response_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingRequest {
    expect: Opcode,
    tx: oneshot::Sender<AccessMessage>,
}

/// Outstanding requests keyed by destination
type PendingRequests = Arc<DashMap<u16, PendingRequest>>;

type SharedHandler = Arc<RwLock<Option<Arc<dyn AccessHandler>>>>;

async fn dispatch(mut access: mpsc::UnboundedReceiver<AccessMessage>, pending: PendingRequests, handler: SharedHandler) {
    while let Some(msg) = access.recv().await {
        let opcode = split_opcode(&msg.payload)
            .ok()
            .and_then(|(value, _)| Opcode::from_value(value));
        if let Some(opcode) = opcode {
            if let Some((_, request)) = pending.remove_if(&msg.src, |_, r| r.expect == opcode) {
                debug!("Access rx {:?} from {:#06x} completes request", opcode, msg.src);
                if request.tx.send(msg).is_err() {
                    debug!("Requester gone before its response arrived");
                }
                continue;
            }
        }
        match handler.read().await.as_ref() {
            Some(handler) => handler.on_access_message(msg),
            None => debug!("Access rx from {:#06x} with no handler, dropped", msg.src),
        }
    }
    info!("Access dispatcher stopped");
}

/// A running node: layer workers, request tracking and the provisioner role
pub struct MeshNode {
    config: MeshNodeConfig,
    keys: Arc<dyn KeyStore>,
    bearer: Arc<dyn Bearer>,
    sender: TransportSender,
    transport: Mutex<Option<Transport>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: PendingRequests,
    handler: SharedHandler,
    provisioner: Provisioner,
}

impl MeshNode {
    /// Start the bearer and spawn the network worker, the transport workers
    /// and the access dispatcher
    pub fn start(
        mut config: MeshNodeConfig,
        keys: Arc<dyn KeyStore>,
        bearer: Arc<dyn Bearer>,
    ) -> Result<Self, NodeError> {
        config.network.unicast_address = config.unicast_address;
        config.transport.unicast_address = config.unicast_address;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        bearer.subscribe(PduKind::Network, inbound_tx);
        bearer.start()?;

        let (upward_tx, upward_rx) = mpsc::unbounded_channel();
        let network_worker =
            NetworkLayer::new(config.network.clone(), keys.clone()).spawn(inbound_rx, upward_tx);
        let network_sender = NetworkSender::new(config.unicast_address, keys.clone(), bearer.clone());

        let (access_tx, access_rx) = mpsc::unbounded_channel();
        let transport = Transport::start(
            config.transport.clone(),
            keys.clone(),
            network_sender,
            upward_rx,
            Arc::new(access_tx),
        );

        let pending: PendingRequests = Arc::new(DashMap::new());
        let handler: SharedHandler = Arc::new(RwLock::new(None));
        let access_worker = tokio::spawn(dispatch(access_rx, pending.clone(), handler.clone()));

        let provisioner = Provisioner::new(config.provisioner.clone(), keys.clone(), bearer.clone());
        info!("Mesh node started for {:#06x}", config.unicast_address);

        Ok(Self {
            sender: transport.sender.clone(),
            transport: Mutex::new(Some(transport)),
            workers: Mutex::new(vec![network_worker, access_worker]),
            config,
            keys,
            bearer,
            pending,
            handler,
            provisioner,
        })
    }

    /// Primary unicast address
    pub fn unicast_address(&self) -> u16 {
        self.config.unicast_address
    }

    /// Key store shared by every layer
    pub fn keys(&self) -> &Arc<dyn KeyStore> {
        &self.keys
    }

    /// Receive every access message that does not complete a request
    pub async fn register_handler(&self, handler: Arc<dyn AccessHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Seal and send an access payload
    pub async fn send_access(&self, dst: u16, key: AccessKey, payload: &[u8]) -> Result<DeliveryHandle, NodeError> {
        Ok(self
            .sender
            .send_access(dst, key, payload, SendOptions::default())
            .await?)
    }

    /// Send and wait until the destination acknowledged every segment
    pub async fn send_segmented_and_wait(
        &self,
        dst: u16,
        key: AccessKey,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Delivery, NodeError> {
        let handle = self.send_access(dst, key, payload).await?;
        let wait = timeout.unwrap_or(self.config.response_timeout);
        match tokio::time::timeout(wait, handle.wait()).await {
            Ok(delivery) => Ok(delivery?),
            Err(_) => Err(NodeError::Timeout { dst }),
        }
    }

    async fn key_for(&self, dst: u16, opcode: Opcode) -> Result<AccessKey, NodeError> {
        if opcode.uses_device_key() {
            return Ok(AccessKey::RemoteDevice);
        }
        let node = self
            .keys
            .find_node_by_source(dst)
            .await?
            .ok_or(StorageError::NodeNotFound(dst))?;
        node.app_keys
            .first()
            .copied()
            .map(AccessKey::Application)
            .ok_or(NodeError::NoAppKey(dst))
    }

    /// Send `pdu` to `dst` and wait for its status message.
    ///
    /// Configuration opcodes go out under the destination's device key,
    /// model opcodes under its first application key. Only one request per
    /// destination may be outstanding.
    pub async fn request(
        &self,
        dst: u16,
        pdu: AccessPdu,
        timeout: Option<Duration>,
    ) -> Result<AccessMessage, NodeError> {
        let expect = pdu.opcode.response().ok_or(NodeError::NoResponse(pdu.opcode))?;
        let key = self.key_for(dst, pdu.opcode).await?;
        let payload = pdu.encode()?;

        let rx = match self.pending.entry(dst) {
            Entry::Occupied(_) => return Err(NodeError::RequestPending(dst)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingRequest { expect, tx });
                rx
            }
        };

        debug!("Request {:?} to {:#06x}, expecting {:?}", pdu.opcode, dst, expect);
        let exchange = async {
            self.send_access(dst, key, &payload).await?.wait().await?;
            let response = rx.await.map_err(|_| NodeError::Stopped)?;
            Ok::<_, NodeError>(response)
        };
        let wait = timeout.unwrap_or(self.config.response_timeout);
        let result = match tokio::time::timeout(wait, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout { dst }),
        };
        if let Err(e) = &result {
            warn!("Request {:?} to {:#06x} failed: {}", pdu.opcode, dst, e);
            self.pending.remove(&dst);
        }
        result
    }

    /// Typed request: send `msg` and decode the response as `R`
    pub async fn call<R: Message>(&self, dst: u16, msg: &impl Message) -> Result<R, NodeError> {
        let response = self.request(dst, msg.to_pdu()?, None).await?;
        R::from_pdu(&AccessPdu::decode(&response.payload)?)
    }

    /// Answer `msg` under the key it arrived with
    pub async fn reply(&self, msg: &AccessMessage, pdu: &AccessPdu) -> Result<(), NodeError> {
        let key = match msg.key {
            KeyUsed::Application(index) => AccessKey::Application(index),
            KeyUsed::Device => AccessKey::RemoteDevice,
            KeyUsed::LocalDevice => AccessKey::LocalDevice,
        };
        self.send_access(msg.src, key, &pdu.encode()?).await?.wait().await?;
        Ok(())
    }

    /// Provision the device `uuid`; a second concurrent call fails with `Busy`
    pub async fn provision(&self, uuid: Uuid) -> Result<Node, NodeError> {
        Ok(self.provisioner.provision(uuid).await?)
    }

    /// Read page 0 of the composition data of `dst`
    pub async fn composition(&self, dst: u16) -> Result<CompositionData, NodeError> {
        self.call(dst, &CompositionDataGet { page: 0 }).await
    }

    /// Hand application key `app_key_index` to the node at `dst`
    pub async fn add_app_key(&self, dst: u16, app_key_index: u16) -> Result<(), NodeError> {
        let app = self.keys.application_key(app_key_index).await?;
        let status: AppKeyStatus = self
            .call(
                dst,
                &AppKeyAdd {
                    net_key_index: app.net_key_index,
                    app_key_index,
                    app_key: app.current.key,
                },
            )
            .await?;
        if status.status != STATUS_SUCCESS {
            return Err(NodeError::Status {
                opcode: Opcode::ConfigAppKeyStatus,
                status: status.status,
            });
        }

        let mut node = self
            .keys
            .find_node_by_source(dst)
            .await?
            .ok_or(StorageError::NodeNotFound(dst))?;
        if !node.app_keys.contains(&app_key_index) {
            node.app_keys.push(app_key_index);
            self.keys.store_node(node).await?;
        }
        info!("App key {} added to {:#06x}", app_key_index, dst);
        Ok(())
    }

    /// Bind application key `app_key_index` to `model` on `element_address`
    pub async fn bind_model(
        &self,
        dst: u16,
        element_address: u16,
        app_key_index: u16,
        model: ModelId,
    ) -> Result<(), NodeError> {
        let status: ModelAppStatus = self
            .call(
                dst,
                &ModelAppBind {
                    element_address,
                    app_key_index,
                    model,
                },
            )
            .await?;
        if status.status != STATUS_SUCCESS {
            return Err(NodeError::Status {
                opcode: Opcode::ConfigModelAppStatus,
                status: status.status,
            });
        }
        info!("{:?} on {:#06x} bound to app key {}", model, element_address, app_key_index);
        Ok(())
    }

    /// Stop every worker and the bearer; waiting requests fail with `Stopped`
    pub async fn shutdown(&self) {
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
        if let Some(transport) = self.transport.lock().await.take() {
            transport.shutdown();
        }
        self.pending.clear();
        self.bearer.stop();
        info!("Mesh node {:#06x} stopped", self.config.unicast_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{CompositionDataGet, OnOffStatus};
    use bytes::Bytes;
    use mesh_crypto::Key128;
    use mesh_storage::{IvIndexState, LocalNode, MemoryKeyStore, NetworkKey};
    use mesh_wire::{ProxyBearer, WireError};

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const DEV_KEY: &str = "9d6dd0e96eb25dc19a40ed9914f8f03f";

    fn key(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    async fn silent_node() -> MeshNode {
        let keys = Arc::new(MemoryKeyStore::new(LocalNode {
            unicast_address: 0x0001,
            element_count: 1,
            device_key: None,
        }));
        keys.add_network_key(NetworkKey::new(0, key(NET_KEY)).unwrap());
        keys.set_iv_index(IvIndexState {
            index: 1,
            updating: false,
        })
        .await;
        keys.store_node(Node {
            uuid: Uuid::from_bytes([1; 16]),
            unicast_address: 0x0100,
            element_count: 1,
            device_key: key(DEV_KEY),
            net_keys: vec![0],
            app_keys: vec![],
            last_seq: None,
            friend: None,
        })
        .await
        .unwrap();

        let bearer = Arc::new(ProxyBearer::new());
        bearer.set_write_handle(Arc::new(|_frame: Bytes| -> Result<(), WireError> { Ok(()) }));
        MeshNode::start(MeshNodeConfig::default(), keys, bearer).unwrap()
    }

    fn composition_get() -> AccessPdu {
        CompositionDataGet { page: 0 }.to_pdu().unwrap()
    }

    fn message(src: u16, pdu: &AccessPdu) -> AccessMessage {
        AccessMessage {
            src,
            dst: 0x0001,
            payload: pdu.encode().unwrap(),
            key: KeyUsed::Application(0),
            net_key_index: 0,
            ttl: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let node = silent_node().await;
        let err = node
            .request(0x0100, composition_get(), Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::Timeout { dst: 0x0100 });
        assert!(node.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_request_per_destination() {
        let node = silent_node().await;
        let first = node.request(0x0100, composition_get(), None);
        tokio::pin!(first);
        tokio::select! {
            biased;
            _ = &mut first => panic!("first request finished early"),
            second = node.request(0x0100, composition_get(), None) => {
                assert_eq!(second.unwrap_err(), NodeError::RequestPending(0x0100));
            }
        }
        assert_eq!(first.await.unwrap_err(), NodeError::Timeout { dst: 0x0100 });
    }

    #[tokio::test]
    async fn test_request_needs_response_opcode_and_app_key() {
        let node = silent_node().await;
        let unack = AccessPdu::new(Opcode::GenericOnOffSetUnacknowledged, vec![0x01, 0x00]);
        assert_eq!(
            node.request(0x0100, unack, None).await.unwrap_err(),
            NodeError::NoResponse(Opcode::GenericOnOffSetUnacknowledged)
        );
        let get = AccessPdu::new(Opcode::GenericOnOffGet, Vec::new());
        assert_eq!(
            node.request(0x0100, get.clone(), None).await.unwrap_err(),
            NodeError::NoAppKey(0x0100)
        );
        assert!(matches!(
            node.request(0x0200, get, None).await.unwrap_err(),
            NodeError::Storage(StorageError::NodeNotFound(0x0200))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_completes_request_or_forwards() {
        let (access_tx, access_rx) = mpsc::unbounded_channel();
        let pending: PendingRequests = Arc::new(DashMap::new());
        let handler: SharedHandler = Arc::new(RwLock::new(None));
        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        *handler.write().await = Some(Arc::new(app_tx));
        tokio::spawn(dispatch(access_rx, pending.clone(), handler));

        let (tx, rx) = oneshot::channel();
        pending.insert(
            0x0100,
            PendingRequest {
                expect: Opcode::GenericOnOffStatus,
                tx,
            },
        );
        let status = OnOffStatus {
            present: true,
            target: None,
        }
        .to_pdu()
        .unwrap();

        // same opcode from another address is unsolicited
        access_tx.send(message(0x0200, &status)).unwrap();
        assert_eq!(app_rx.recv().await.unwrap().src, 0x0200);
        // wrong opcode from the right address as well
        access_tx.send(message(0x0100, &composition_get())).unwrap();
        assert_eq!(app_rx.recv().await.unwrap().src, 0x0100);
        assert_eq!(pending.len(), 1);

        access_tx.send(message(0x0100, &status)).unwrap();
        let response = rx.await.unwrap();
        assert_eq!(AccessPdu::decode(&response.payload).unwrap(), status);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_bearer() {
        let node = silent_node().await;
        node.shutdown().await;
        assert!(node.bearer.send_net_pdu(&[0; 14]).is_err());
        assert!(matches!(
            node.request(0x0100, composition_get(), None).await,
            Err(NodeError::Transport(_))
        ));
    }
}
