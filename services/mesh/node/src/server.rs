//! Configuration and Generic OnOff server of a simulated device.

use crate::access::{
    AccessPdu, AppKeyAdd, AppKeyStatus, CompositionData, CompositionDataGet, DefaultTtlGet, DefaultTtlStatus,
    Element, Message, ModelAppBind, ModelAppStatus, ModelId, OnOffGet, OnOffSet, OnOffStatus, Opcode,
    STATUS_INVALID_ADDRESS, STATUS_INVALID_APP_KEY_INDEX, STATUS_INVALID_MODEL, STATUS_INVALID_NET_KEY_INDEX,
    STATUS_SUCCESS,
};
use crate::error::NodeError;
use crate::node::MeshNode;
use mesh_storage::{ApplicationKey, KeyStore, MemoryKeyStore, StorageError};
use mesh_transport::{AccessMessage, KeyUsed};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn hosts(element: &Element, model: ModelId) -> bool {
    match model {
        ModelId::Sig(id) => element.sig_models.contains(&id),
        vendor => element.vendor_models.contains(&vendor),
    }
}

/// Answers configuration requests and drives one OnOff state per element
pub struct ModelServer {
    node: Arc<MeshNode>,
    keys: Arc<MemoryKeyStore>,
    composition: CompositionData,
    default_ttl: u8,
    onoff: HashMap<u16, bool>,
    bindings: HashSet<(u16, ModelId, u16)>,
}

impl ModelServer {
    /// Server for the elements described by `composition`
    pub fn new(node: Arc<MeshNode>, keys: Arc<MemoryKeyStore>, composition: CompositionData, default_ttl: u8) -> Self {
        Self {
            node,
            keys,
            composition,
            default_ttl,
            onoff: HashMap::new(),
            bindings: HashSet::new(),
        }
    }

    /// Register with the node and serve on a task of its own
    pub async fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.node.register_handler(Arc::new(tx)).await;
        tokio::spawn(self.run(rx))
    }

    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<AccessMessage>) {
        info!("Model server started on {:#06x}", self.node.unicast_address());
        while let Some(msg) = inbound.recv().await {
            match self.handle(&msg).await {
                Ok(Some(reply)) => {
                    if let Err(e) = self.node.reply(&msg, &reply).await {
                        warn!("Reply {:?} to {:#06x} failed: {}", reply.opcode, msg.src, e);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Access rx from {:#06x} dropped: {}", msg.src, e),
            }
        }
    }

    /// Apply one message; returns the status to send back, if any
    pub async fn handle(&mut self, msg: &AccessMessage) -> Result<Option<AccessPdu>, NodeError> {
        let pdu = AccessPdu::decode(&msg.payload)?;
        let by_device_key = !matches!(msg.key, KeyUsed::Application(_));
        if pdu.opcode.uses_device_key() != by_device_key {
            debug!("{:?} from {:#06x} under the wrong key class", pdu.opcode, msg.src);
            return Ok(None);
        }

        let reply = match pdu.opcode {
            Opcode::ConfigCompositionDataGet => {
                CompositionDataGet::from_pdu(&pdu)?;
                self.composition.to_pdu()?
            }
            Opcode::ConfigDefaultTtlGet => {
                DefaultTtlGet::from_pdu(&pdu)?;
                DefaultTtlStatus { ttl: self.default_ttl }.to_pdu()?
            }
            Opcode::ConfigAppKeyAdd => self.app_key_add(AppKeyAdd::from_pdu(&pdu)?).await?.to_pdu()?,
            Opcode::ConfigModelAppBind => self.bind(ModelAppBind::from_pdu(&pdu)?).await.to_pdu()?,
            Opcode::GenericOnOffGet | Opcode::GenericOnOffSet | Opcode::GenericOnOffSetUnacknowledged => {
                let bound = match msg.key {
                    KeyUsed::Application(index) => self
                        .bindings
                        .contains(&(msg.dst, ModelId::GENERIC_ONOFF_SERVER, index)),
                    _ => false,
                };
                if !bound {
                    debug!("OnOff server on {:#06x} not bound to the key used", msg.dst);
                    return Ok(None);
                }
                if pdu.opcode == Opcode::GenericOnOffGet {
                    OnOffGet::from_pdu(&pdu)?;
                } else {
                    let set = OnOffSet::decode_params(&pdu.params)?;
                    self.onoff.insert(msg.dst, set.on);
                    info!("OnOff {:#06x} now {}", msg.dst, if set.on { "on" } else { "off" });
                    if pdu.opcode == Opcode::GenericOnOffSetUnacknowledged {
                        return Ok(None);
                    }
                }
                OnOffStatus {
                    present: self.onoff.get(&msg.dst).copied().unwrap_or(false),
                    target: None,
                }
                .to_pdu()?
            }
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    async fn app_key_add(&self, add: AppKeyAdd) -> Result<AppKeyStatus, NodeError> {
        let status = if self.keys.network_key(add.net_key_index).await.is_err() {
            STATUS_INVALID_NET_KEY_INDEX
        } else {
            let key = ApplicationKey::new(add.app_key_index, add.net_key_index, add.app_key)
                .map_err(StorageError::from)?;
            self.keys.add_application_key(key);
            STATUS_SUCCESS
        };
        Ok(AppKeyStatus {
            status,
            net_key_index: add.net_key_index,
            app_key_index: add.app_key_index,
        })
    }

    async fn bind(&mut self, bind: ModelAppBind) -> ModelAppStatus {
        let element = bind
            .element_address
            .checked_sub(self.node.unicast_address())
            .and_then(|offset| self.composition.elements.get(offset as usize));
        let status = match element {
            None => STATUS_INVALID_ADDRESS,
            Some(element) if !hosts(element, bind.model) => STATUS_INVALID_MODEL,
            Some(_) => {
                if self.keys.application_key(bind.app_key_index).await.is_err() {
                    STATUS_INVALID_APP_KEY_INDEX
                } else {
                    self.bindings
                        .insert((bind.element_address, bind.model, bind.app_key_index));
                    STATUS_SUCCESS
                }
            }
        };
        ModelAppStatus {
            status,
            element_address: bind.element_address,
            app_key_index: bind.app_key_index,
            model: bind.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MeshNodeConfig;
    use mesh_crypto::Key128;
    use mesh_provision::{respond, DeviceProvisioned};
    use mesh_storage::{IvIndexState, LocalNode, NetworkKey};
    use mesh_wire::{loopback_pair, Bearer, Capabilities, PduKind, ProxyBearer};
    use std::time::Duration;
    use uuid::Uuid;

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
    const APP_KEY: &str = "63964771734fbd76e3b40519d1d94a48";

    fn key(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    fn composition() -> CompositionData {
        CompositionData {
            page: 0,
            cid: 0x0059,
            pid: 0x0001,
            vid: 0x0001,
            crpl: 0x0020,
            features: 0,
            elements: vec![Element {
                location: 0x0100,
                sig_models: vec![0x0000, 0x1000],
                vendor_models: vec![],
            }],
        }
    }

    async fn provisioner_store() -> Arc<MemoryKeyStore> {
        let keys = Arc::new(
            MemoryKeyStore::new(LocalNode {
                unicast_address: 0x0001,
                element_count: 1,
                device_key: None,
            })
            .with_low_address(0x0100),
        );
        keys.add_network_key(NetworkKey::new(0, key(NET_KEY)).unwrap());
        keys.add_application_key(ApplicationKey::new(1, 0, key(APP_KEY)).unwrap());
        keys.set_iv_index(IvIndexState {
            index: 0x0000_0005,
            updating: false,
        })
        .await;
        keys
    }

    async fn device_store(provisioned: &DeviceProvisioned) -> Arc<MemoryKeyStore> {
        let keys = Arc::new(MemoryKeyStore::new(LocalNode {
            unicast_address: provisioned.data.unicast_address,
            element_count: 1,
            device_key: None,
        }));
        keys.add_network_key(NetworkKey::new(provisioned.data.key_index, provisioned.data.net_key).unwrap());
        keys.set_iv_index(IvIndexState {
            index: provisioned.data.iv_index,
            updating: false,
        })
        .await;
        keys.set_local_device_key(provisioned.data.unicast_address, provisioned.device_key)
            .await;
        keys
    }

    #[tokio::test]
    async fn test_two_node_loopback() {
        let prov_bearer = Arc::new(ProxyBearer::new());
        let dev_bearer = Arc::new(ProxyBearer::new());
        loopback_pair(&prov_bearer, &dev_bearer);
        dev_bearer.start().unwrap();

        let prov_keys = provisioner_store().await;
        let provisioner = MeshNode::start(MeshNodeConfig::default(), prov_keys.clone(), prov_bearer).unwrap();

        let (dev_tx, mut dev_rx) = mpsc::unbounded_channel();
        dev_bearer.subscribe(PduKind::Provisioning, dev_tx);
        let caps = Capabilities {
            elements: 1,
            algorithms: 0x0001,
            ..Default::default()
        };
        let uuid = Uuid::from_bytes([7; 16]);
        let (node, provisioned) = tokio::join!(
            provisioner.provision(uuid),
            respond(dev_bearer.as_ref(), &mut dev_rx, caps, Duration::from_secs(2))
        );
        let node = node.unwrap();
        let provisioned = provisioned.unwrap();
        assert_eq!(node.unicast_address, 0x0100);

        let dev_keys = device_store(&provisioned).await;
        let device = Arc::new(
            MeshNode::start(
                MeshNodeConfig {
                    unicast_address: 0x0100,
                    ..Default::default()
                },
                dev_keys.clone(),
                dev_bearer,
            )
            .unwrap(),
        );
        ModelServer::new(device.clone(), dev_keys.clone(), composition(), 7)
            .spawn()
            .await;

        assert_eq!(provisioner.composition(0x0100).await.unwrap(), composition());

        // not bound yet
        assert!(matches!(
            provisioner
                .call::<OnOffStatus>(0x0100, &OnOffGet)
                .await,
            Err(NodeError::NoAppKey(0x0100))
        ));

        provisioner.add_app_key(0x0100, 1).await.unwrap();
        assert!(dev_keys.application_key(1).await.is_ok());
        assert_eq!(prov_keys.find_node_by_source(0x0100).await.unwrap().unwrap().app_keys, vec![1]);

        let err = provisioner
            .bind_model(0x0100, 0x0100, 1, ModelId::Sig(0x1300))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::Status {
                opcode: Opcode::ConfigModelAppStatus,
                status: STATUS_INVALID_MODEL
            }
        );
        provisioner
            .bind_model(0x0100, 0x0100, 1, ModelId::GENERIC_ONOFF_SERVER)
            .await
            .unwrap();

        let set = OnOffSet {
            on: true,
            tid: 1,
            transition: None,
        };
        let status: OnOffStatus = provisioner.call(0x0100, &set).await.unwrap();
        assert!(status.present);
        let status: OnOffStatus = provisioner.call(0x0100, &OnOffGet).await.unwrap();
        assert!(status.present);

        let ttl: DefaultTtlStatus = provisioner.call(0x0100, &DefaultTtlGet).await.unwrap();
        assert_eq!(ttl.ttl, 7);

        provisioner.shutdown().await;
        device.shutdown().await;
    }
}
