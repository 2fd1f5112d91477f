//! Async drivers running the state machines over a bearer.

use crate::error::ProvisionError;
use crate::session::{DeviceProvisioned, DeviceSession, Output, ProvisioningSession, ProvisioningState};
use bytes::Bytes;
use mesh_storage::{KeyRefreshPhase, KeyStore, Node};
use mesh_wire::{Bearer, Capabilities, PduKind, ProvisioningData, ProvisioningFlags, ProvisioningPdu};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Provisioner settings
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Network key handed to new nodes
    pub net_key_index: u16,
    /// Attention timer requested in the Invite, seconds
    pub attention_duration: u8,
    /// Wait for each inbound PDU
    pub pdu_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            net_key_index: 0,
            attention_duration: 5,
            pdu_timeout: Duration::from_secs(30),
        }
    }
}

async fn next_pdu(
    inbound: &mut mpsc::UnboundedReceiver<Bytes>,
    wait: Duration,
    state: ProvisioningState,
) -> Result<Bytes, ProvisionError> {
    match tokio::time::timeout(wait, inbound.recv()).await {
        Ok(Some(raw)) => Ok(raw),
        Ok(None) => Err(ProvisionError::Stopped),
        Err(_) => Err(ProvisionError::Timeout(state)),
    }
}

fn write(bearer: &dyn Bearer, pdu: &ProvisioningPdu) -> Result<(), ProvisionError> {
    debug!("Provisioning tx {:?}", pdu.pdu_type());
    bearer.send_prov_pdu(&pdu.encode()?)?;
    Ok(())
}

/// Provisions devices over one bearer, one session at a time
pub struct Provisioner {
    config: ProvisionerConfig,
    keys: Arc<dyn KeyStore>,
    bearer: Arc<dyn Bearer>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl Provisioner {
    /// Take over the provisioning queue of `bearer`
    pub fn new(config: ProvisionerConfig, keys: Arc<dyn KeyStore>, bearer: Arc<dyn Bearer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        bearer.subscribe(PduKind::Provisioning, tx);
        Self {
            config,
            keys,
            bearer,
            inbound: Mutex::new(rx),
        }
    }

    /// Run a full session with the device `uuid` and store the resulting node
    pub async fn provision(&self, uuid: Uuid) -> Result<Node, ProvisionError> {
        let mut inbound = self.inbound.try_lock().map_err(|_| ProvisionError::Busy)?;
        // leftovers of an earlier session
        while inbound.try_recv().is_ok() {}

        info!("Provisioning {} started", uuid);
        let mut session = ProvisioningSession::new(uuid, self.config.attention_duration);
        write(self.bearer.as_ref(), &session.invite()?)?;

        loop {
            let raw = match next_pdu(&mut inbound, self.config.pdu_timeout, session.state()).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Provisioning {} aborted: {}", uuid, e);
                    session.fail();
                    return Err(e);
                }
            };
            match session.handle(&raw)? {
                Output::Send(pdus) => {
                    for pdu in &pdus {
                        write(self.bearer.as_ref(), pdu)?;
                    }
                }
                Output::AddressNeeded { element_count } => {
                    let data = match self.provisioning_data(uuid, element_count).await {
                        Ok(data) => data,
                        Err(e) => {
                            session.fail();
                            return Err(e);
                        }
                    };
                    write(self.bearer.as_ref(), &session.distribute(data)?)?;
                }
                Output::Complete(device) => {
                    let node = Node {
                        uuid: device.uuid,
                        unicast_address: device.data.unicast_address,
                        element_count: device.capabilities.elements,
                        device_key: device.device_key,
                        net_keys: vec![self.config.net_key_index],
                        app_keys: Vec::new(),
                        last_seq: None,
                        friend: None,
                    };
                    self.keys.store_node(node.clone()).await?;
                    return Ok(node);
                }
            }
        }
    }

    async fn provisioning_data(&self, uuid: Uuid, element_count: u8) -> Result<ProvisioningData, ProvisionError> {
        let unicast_address = self.keys.allocate_unicast_address(uuid, element_count).await?;
        let net_key = self.keys.network_key(self.config.net_key_index).await?;
        let iv = self.keys.current_iv_index().await?;

        let mut flags = ProvisioningFlags::empty();
        if net_key.phase == KeyRefreshPhase::Phase2 {
            flags |= ProvisioningFlags::KEY_REFRESH;
        }
        if iv.updating {
            flags |= ProvisioningFlags::IV_UPDATE;
        }
        Ok(ProvisioningData {
            net_key: net_key.current.key,
            key_index: net_key.index,
            flags,
            iv_index: iv.index,
            unicast_address,
        })
    }
}

/// Answer one provisioning session as an unprovisioned device on `bearer`.
/// Errors are reported to the provisioner with a Failed PDU.
pub async fn respond(
    bearer: &dyn Bearer,
    inbound: &mut mpsc::UnboundedReceiver<Bytes>,
    capabilities: Capabilities,
    pdu_timeout: Duration,
) -> Result<DeviceProvisioned, ProvisionError> {
    let mut session = DeviceSession::new(capabilities);
    loop {
        let raw = next_pdu(inbound, pdu_timeout, ProvisioningState::Idle).await?;
        match session.handle(&raw) {
            Ok(reply) => {
                if let Some(pdu) = reply {
                    write(bearer, &pdu)?;
                }
                if let Some(done) = session.provisioned() {
                    return Ok(done.clone());
                }
            }
            Err(e @ ProvisionError::RemoteFailed(_)) => return Err(e),
            Err(e) => {
                write(bearer, &ProvisioningPdu::Failed(e.failure_code()))?;
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::Key128;
    use mesh_storage::{IvIndexState, LocalNode, MemoryKeyStore, NetworkKey};
    use mesh_wire::{loopback_pair, FailureCode, ProxyBearer, WireError};

    const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";

    fn key(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    async fn store() -> Arc<MemoryKeyStore> {
        let keys = Arc::new(
            MemoryKeyStore::new(LocalNode {
                unicast_address: 0x0001,
                element_count: 1,
                device_key: None,
            })
            .with_low_address(0x0100),
        );
        keys.add_network_key(NetworkKey::new(0, key(NET_KEY)).unwrap());
        keys.set_iv_index(IvIndexState {
            index: 0x1234_5678,
            updating: true,
        })
        .await;
        keys
    }

    fn caps(elements: u8) -> Capabilities {
        Capabilities {
            elements,
            algorithms: 0x0001,
            ..Default::default()
        }
    }

    fn linked() -> (Arc<ProxyBearer>, Arc<ProxyBearer>) {
        let a = Arc::new(ProxyBearer::new());
        let b = Arc::new(ProxyBearer::new());
        loopback_pair(&a, &b);
        a.start().unwrap();
        b.start().unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_provision_over_proxy_bearer() {
        let keys = store().await;
        let (prov_bearer, dev_bearer) = linked();
        let (dev_tx, mut dev_rx) = mpsc::unbounded_channel();
        dev_bearer.subscribe(PduKind::Provisioning, dev_tx);

        let provisioner = Provisioner::new(ProvisionerConfig::default(), keys.clone(), prov_bearer);
        let uuid = Uuid::from_bytes([3; 16]);

        let device = respond(dev_bearer.as_ref(), &mut dev_rx, caps(2), Duration::from_secs(1));
        let (node, provisioned) = tokio::join!(provisioner.provision(uuid), device);
        let node = node.unwrap();
        let provisioned = provisioned.unwrap();

        assert_eq!(node.unicast_address, 0x0100);
        assert_eq!(node.element_count, 2);
        assert_eq!(node.net_keys, vec![0]);
        assert_eq!(node.device_key, provisioned.device_key);
        assert_eq!(provisioned.data.net_key, key(NET_KEY));
        assert_eq!(provisioned.data.iv_index, 0x1234_5678);
        assert_eq!(provisioned.data.flags, ProvisioningFlags::IV_UPDATE);
        assert_eq!(keys.find_node_by_source(0x0101).await.unwrap(), Some(node));
    }

    #[tokio::test]
    async fn test_reprovision_reuses_address() {
        let keys = store().await;
        let (prov_bearer, dev_bearer) = linked();
        let (dev_tx, mut dev_rx) = mpsc::unbounded_channel();
        dev_bearer.subscribe(PduKind::Provisioning, dev_tx);
        let provisioner = Provisioner::new(ProvisionerConfig::default(), keys.clone(), prov_bearer);
        let uuid = Uuid::from_bytes([4; 16]);

        for _ in 0..2 {
            let device = respond(dev_bearer.as_ref(), &mut dev_rx, caps(1), Duration::from_secs(1));
            let (node, _) = tokio::join!(provisioner.provision(uuid), device);
            assert_eq!(node.unwrap().unicast_address, 0x0100);
        }
        assert_eq!(keys.nodes().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let keys = store().await;
        let bearer = Arc::new(ProxyBearer::new());
        bearer.set_write_handle(Arc::new(|_frame: Bytes| -> Result<(), WireError> { Ok(()) }));
        bearer.start().unwrap();

        let provisioner = Provisioner::new(ProvisionerConfig::default(), keys, bearer);
        let err = provisioner.provision(Uuid::nil()).await.unwrap_err();
        assert_eq!(err, ProvisionError::Timeout(ProvisioningState::AwaitCapabilities));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_is_busy() {
        let keys = store().await;
        let bearer = Arc::new(ProxyBearer::new());
        bearer.set_write_handle(Arc::new(|_frame: Bytes| -> Result<(), WireError> { Ok(()) }));
        bearer.start().unwrap();
        let provisioner = Provisioner::new(ProvisionerConfig::default(), keys, bearer);

        let first = provisioner.provision(Uuid::from_bytes([1; 16]));
        tokio::pin!(first);
        tokio::select! {
            biased;
            _ = &mut first => panic!("first session finished early"),
            second = provisioner.provision(Uuid::from_bytes([2; 16])) => {
                assert_eq!(second.unwrap_err(), ProvisionError::Busy);
            }
        }
        assert!(matches!(first.await, Err(ProvisionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_device_reports_failure_to_provisioner() {
        let (prov_bearer, dev_bearer) = linked();
        let (dev_tx, mut dev_rx) = mpsc::unbounded_channel();
        dev_bearer.subscribe(PduKind::Provisioning, dev_tx);
        let (prov_tx, mut prov_rx) = mpsc::unbounded_channel();
        prov_bearer.subscribe(PduKind::Provisioning, prov_tx);

        // Random before Invite
        prov_bearer.send_prov_pdu(&[0x06; 17]).unwrap();
        let err = respond(dev_bearer.as_ref(), &mut dev_rx, caps(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::OutOfOrder { .. }));

        let reply = prov_rx.recv().await.unwrap();
        assert_eq!(
            ProvisioningPdu::decode(&reply).unwrap(),
            ProvisioningPdu::Failed(FailureCode::UnexpectedPdu)
        );
    }
}
