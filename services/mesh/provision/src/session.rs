//! Provisioning state machines without I/O.
//!
//! ```text
//! Provisioner                          Device
//!   Invite            ------------->
//!                     <-------------   Capabilities
//!   Start, PublicKey  ------------->
//!                     <-------------   PublicKey
//!   Confirmation      ------------->
//!                     <-------------   Confirmation
//!   Random            ------------->
//!                     <-------------   Random
//!   Data              ------------->
//!                     <-------------   Complete
//! ```
//!
//! Each side is fed raw PDUs (type octet included) and answers with the PDUs
//! to write. Any error moves the session to `Failed` for good.

use crate::error::ProvisionError;
use crate::handshake::{Handshake, SessionKeys};
use mesh_crypto::Key128;
use mesh_wire::{Capabilities, ProvPduType, ProvisioningData, ProvisioningPdu, Start};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Progress of a provisioning session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Nothing sent yet
    Idle,
    /// Invite sent
    AwaitCapabilities,
    /// Start and public key sent
    AwaitPublicKey,
    /// Confirmation sent
    AwaitConfirmation,
    /// Random sent
    AwaitRandom,
    /// Confirmation verified; provisioning data not yet sent
    AwaitAddress,
    /// Provisioning data sent
    AwaitComplete,
    /// Device confirmed
    Complete,
    /// Aborted
    Failed,
}

/// Outcome of feeding a PDU to a [`ProvisioningSession`]
#[derive(Debug)]
pub enum Output {
    /// Write these PDUs, in order
    Send(Vec<ProvisioningPdu>),
    /// The device checked out; call [`ProvisioningSession::distribute`] with
    /// the data for a node of `element_count` elements
    AddressNeeded {
        /// Elements reported in Capabilities
        element_count: u8,
    },
    /// The device acknowledged the provisioning data
    Complete(ProvisionedDevice),
}

/// Result of a completed handshake, on the provisioner side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDevice {
    /// Device UUID
    pub uuid: Uuid,
    /// Reported capabilities
    pub capabilities: Capabilities,
    /// Data the device was given
    pub data: ProvisioningData,
    /// Device key both sides derived
    pub device_key: Key128,
}

fn parse(raw: &[u8]) -> Result<ProvisioningPdu, ProvisionError> {
    match ProvisioningPdu::decode(raw).map_err(ProvisionError::Malformed)? {
        ProvisioningPdu::Failed(code) => Err(ProvisionError::RemoteFailed(code)),
        pdu => Ok(pdu),
    }
}

/// Provisioner side of one session
#[derive(Debug)]
pub struct ProvisioningSession {
    uuid: Uuid,
    attention_duration: u8,
    state: ProvisioningState,
    handshake: Handshake,
    capabilities: Option<Capabilities>,
    peer_confirmation: [u8; 16],
    keys: Option<SessionKeys>,
    data: Option<ProvisioningData>,
}

impl ProvisioningSession {
    /// New session for the device `uuid`
    pub fn new(uuid: Uuid, attention_duration: u8) -> Self {
        Self {
            uuid,
            attention_duration,
            state: ProvisioningState::Idle,
            handshake: Handshake::new(),
            capabilities: None,
            peer_confirmation: [0u8; 16],
            keys: None,
            data: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Device being provisioned
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The Invite that opens the session
    pub fn invite(&mut self) -> Result<ProvisioningPdu, ProvisionError> {
        if self.state != ProvisioningState::Idle {
            return Err(ProvisionError::Closed(self.state));
        }
        let invite = ProvisioningPdu::Invite {
            attention_duration: self.attention_duration,
        };
        self.handshake.inputs.extend_from_slice(&invite.payload()?);
        self.state = ProvisioningState::AwaitCapabilities;
        debug!("Provisioning {} invite attention={}s", self.uuid, self.attention_duration);
        Ok(invite)
    }

    /// Feed one inbound PDU
    pub fn handle(&mut self, raw: &[u8]) -> Result<Output, ProvisionError> {
        if matches!(self.state, ProvisioningState::Complete | ProvisioningState::Failed) {
            return Err(ProvisionError::Closed(self.state));
        }
        let result = parse(raw).and_then(|pdu| self.step(pdu, &raw[1..]));
        if let Err(e) = &result {
            warn!("Provisioning {} failed in {:?}: {}", self.uuid, self.state, e);
            self.state = ProvisioningState::Failed;
        }
        result
    }

    fn unexpected(&self, pdu: &ProvisioningPdu) -> ProvisionError {
        ProvisionError::UnexpectedPdu {
            state: self.state,
            got: pdu.pdu_type(),
        }
    }

    fn step(&mut self, pdu: ProvisioningPdu, payload: &[u8]) -> Result<Output, ProvisionError> {
        match (self.state, pdu) {
            (ProvisioningState::AwaitCapabilities, ProvisioningPdu::Capabilities(caps)) => {
                if caps.elements == 0 {
                    return Err(ProvisionError::Unsupported("device reports no elements"));
                }
                if caps.algorithms & 0x0001 == 0 {
                    return Err(ProvisionError::Unsupported("fips p-256 not supported"));
                }
                debug!("Provisioning {} capabilities {:?}", self.uuid, caps);
                self.handshake.inputs.extend_from_slice(payload);
                self.capabilities = Some(caps);

                let start = ProvisioningPdu::Start(Start::no_oob());
                self.handshake.inputs.extend_from_slice(&start.payload()?);
                let public = *self.handshake.key_pair.public_key();
                self.handshake.inputs.extend_from_slice(&public);

                self.state = ProvisioningState::AwaitPublicKey;
                Ok(Output::Send(vec![start, ProvisioningPdu::PublicKey(public)]))
            }
            (ProvisioningState::AwaitPublicKey, ProvisioningPdu::PublicKey(peer)) => {
                self.handshake.inputs.extend_from_slice(&peer);
                let confirmation = self.handshake.agree(&peer)?;
                self.state = ProvisioningState::AwaitConfirmation;
                Ok(Output::Send(vec![ProvisioningPdu::Confirmation(confirmation)]))
            }
            (ProvisioningState::AwaitConfirmation, ProvisioningPdu::Confirmation(value)) => {
                self.peer_confirmation = value;
                self.state = ProvisioningState::AwaitRandom;
                Ok(Output::Send(vec![ProvisioningPdu::Random(self.handshake.random)]))
            }
            (ProvisioningState::AwaitRandom, ProvisioningPdu::Random(peer_random)) => {
                if !self.handshake.verify(&peer_random, &self.peer_confirmation)? {
                    return Err(ProvisionError::ConfirmationFailed);
                }
                self.keys = Some(self.handshake.session_keys(&self.handshake.random, &peer_random)?);
                self.state = ProvisioningState::AwaitAddress;
                let element_count = self.capabilities.map_or(1, |c| c.elements);
                Ok(Output::AddressNeeded { element_count })
            }
            (ProvisioningState::AwaitComplete, ProvisioningPdu::Complete) => {
                let (Some(keys), Some(data), Some(capabilities)) = (&self.keys, self.data, self.capabilities) else {
                    return Err(ProvisionError::Closed(self.state));
                };
                self.state = ProvisioningState::Complete;
                info!(
                    "Provisioning {} complete: address {:#06x} elements {}",
                    self.uuid, data.unicast_address, capabilities.elements
                );
                Ok(Output::Complete(ProvisionedDevice {
                    uuid: self.uuid,
                    capabilities,
                    data,
                    device_key: keys.device_key,
                }))
            }
            (_, pdu) => Err(self.unexpected(&pdu)),
        }
    }

    /// Seal the provisioning data once [`Output::AddressNeeded`] was returned
    pub fn distribute(&mut self, data: ProvisioningData) -> Result<ProvisioningPdu, ProvisionError> {
        if self.state != ProvisioningState::AwaitAddress {
            return Err(ProvisionError::Closed(self.state));
        }
        let keys = self.keys.as_ref().ok_or(ProvisionError::Closed(self.state))?;
        let (encrypted, mic) = keys.seal(&data.encode()?)?;
        self.data = Some(data);
        self.state = ProvisioningState::AwaitComplete;
        debug!("Provisioning {} data sent to {:#06x}", self.uuid, data.unicast_address);
        Ok(ProvisioningPdu::Data { encrypted, mic })
    }

    /// Abort locally, e.g. on timeout
    pub fn fail(&mut self) {
        self.state = ProvisioningState::Failed;
    }
}

/// What a device learned from a completed session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProvisioned {
    /// Decrypted provisioning data
    pub data: ProvisioningData,
    /// Device key both sides derived
    pub device_key: Key128,
}

/// Device side of one session
#[derive(Debug)]
pub struct DeviceSession {
    capabilities: Capabilities,
    state: ProvPduType,
    handshake: Handshake,
    peer_confirmation: [u8; 16],
    keys: Option<SessionKeys>,
    failed: bool,
    provisioned: Option<DeviceProvisioned>,
}

impl DeviceSession {
    /// Responder advertising `capabilities`
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            state: ProvPduType::Invite,
            handshake: Handshake::new(),
            peer_confirmation: [0u8; 16],
            keys: None,
            failed: false,
            provisioned: None,
        }
    }

    /// PDU type the device waits for next
    pub fn expecting(&self) -> ProvPduType {
        self.state
    }

    /// Set once Data was accepted
    pub fn provisioned(&self) -> Option<&DeviceProvisioned> {
        self.provisioned.as_ref()
    }

    /// Feed one inbound PDU; the reply to write, if any. On error the
    /// caller reports `Failed` with [`ProvisionError::failure_code`].
    pub fn handle(&mut self, raw: &[u8]) -> Result<Option<ProvisioningPdu>, ProvisionError> {
        if self.failed || self.provisioned.is_some() {
            return Err(ProvisionError::Closed(self.session_state()));
        }
        let result = parse(raw).and_then(|pdu| self.step(pdu, &raw[1..]));
        if let Err(e) = &result {
            warn!("Device provisioning failed waiting for {:?}: {}", self.state, e);
            self.failed = true;
        }
        result
    }

    fn session_state(&self) -> ProvisioningState {
        if self.failed {
            ProvisioningState::Failed
        } else {
            ProvisioningState::Complete
        }
    }

    fn step(&mut self, pdu: ProvisioningPdu, payload: &[u8]) -> Result<Option<ProvisioningPdu>, ProvisionError> {
        if pdu.pdu_type() != self.state {
            return Err(ProvisionError::OutOfOrder {
                expected: self.state,
                got: pdu.pdu_type(),
            });
        }
        match pdu {
            ProvisioningPdu::Invite { .. } => {
                self.handshake.inputs.extend_from_slice(payload);
                let caps = ProvisioningPdu::Capabilities(self.capabilities);
                self.handshake.inputs.extend_from_slice(&caps.payload()?);
                self.state = ProvPduType::Start;
                Ok(Some(caps))
            }
            ProvisioningPdu::Start(start) => {
                if start != Start::no_oob() {
                    return Err(ProvisionError::Unsupported("only no-oob provisioning"));
                }
                self.handshake.inputs.extend_from_slice(payload);
                self.state = ProvPduType::PublicKey;
                Ok(None)
            }
            ProvisioningPdu::PublicKey(peer) => {
                let public = *self.handshake.key_pair.public_key();
                self.handshake.inputs.extend_from_slice(&peer);
                self.handshake.inputs.extend_from_slice(&public);
                self.handshake.agree(&peer)?;
                self.state = ProvPduType::Confirmation;
                Ok(Some(ProvisioningPdu::PublicKey(public)))
            }
            ProvisioningPdu::Confirmation(value) => {
                self.peer_confirmation = value;
                let own = self.handshake.confirmation_of(&self.handshake.random)?;
                self.state = ProvPduType::Random;
                Ok(Some(ProvisioningPdu::Confirmation(own)))
            }
            ProvisioningPdu::Random(peer_random) => {
                if !self.handshake.verify(&peer_random, &self.peer_confirmation)? {
                    return Err(ProvisionError::ConfirmationFailed);
                }
                self.keys = Some(self.handshake.session_keys(&peer_random, &self.handshake.random)?);
                self.state = ProvPduType::Data;
                Ok(Some(ProvisioningPdu::Random(self.handshake.random)))
            }
            ProvisioningPdu::Data { encrypted, mic } => {
                let keys = self.keys.as_ref().ok_or(ProvisionError::DecryptionFailed)?;
                let block = keys
                    .open(&encrypted, &mic)
                    .map_err(|_| ProvisionError::DecryptionFailed)?;
                let data = ProvisioningData::decode(&block).map_err(ProvisionError::Malformed)?;
                info!("Device provisioned as {:#06x}", data.unicast_address);
                self.provisioned = Some(DeviceProvisioned {
                    data,
                    device_key: keys.device_key,
                });
                self.state = ProvPduType::Complete;
                Ok(Some(ProvisioningPdu::Complete))
            }
            other => Err(ProvisionError::OutOfOrder {
                expected: self.state,
                got: other.pdu_type(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::{FailureCode, ProvisioningFlags};

    fn caps() -> Capabilities {
        Capabilities {
            elements: 2,
            algorithms: 0x0001,
            ..Default::default()
        }
    }

    fn data(addr: u16) -> ProvisioningData {
        ProvisioningData {
            net_key: hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap().try_into().unwrap(),
            key_index: 0,
            flags: ProvisioningFlags::empty(),
            iv_index: 0x1234_5678,
            unicast_address: addr,
        }
    }

    fn encode(pdu: &ProvisioningPdu) -> Vec<u8> {
        pdu.encode().unwrap().to_vec()
    }

    /// Drive both sides; `tamper` may rewrite any device reply in flight
    fn run(
        prov: &mut ProvisioningSession,
        dev: &mut DeviceSession,
        tamper: impl Fn(&mut Vec<u8>),
    ) -> Result<ProvisionedDevice, ProvisionError> {
        let mut to_device = vec![encode(&prov.invite()?)];
        loop {
            let mut to_provisioner = Vec::new();
            for raw in to_device.drain(..) {
                if let Some(reply) = dev.handle(&raw)? {
                    let mut bytes = encode(&reply);
                    tamper(&mut bytes);
                    to_provisioner.push(bytes);
                }
            }
            for raw in to_provisioner {
                match prov.handle(&raw)? {
                    Output::Send(pdus) => to_device.extend(pdus.iter().map(encode)),
                    Output::AddressNeeded { element_count } => {
                        assert_eq!(element_count, 2);
                        to_device.push(encode(&prov.distribute(data(0x0100))?));
                    }
                    Output::Complete(device) => return Ok(device),
                }
            }
        }
    }

    #[test]
    fn test_handshake_agrees_on_device_key() {
        let uuid = Uuid::from_bytes([7; 16]);
        let mut prov = ProvisioningSession::new(uuid, 5);
        let mut dev = DeviceSession::new(caps());

        let device = run(&mut prov, &mut dev, |_| {}).unwrap();
        assert_eq!(prov.state(), ProvisioningState::Complete);
        assert_eq!(device.uuid, uuid);
        assert_eq!(device.capabilities, caps());
        assert_eq!(device.data, data(0x0100));

        let provisioned = dev.provisioned().unwrap();
        assert_eq!(provisioned.device_key, device.device_key);
        assert_eq!(provisioned.data, data(0x0100));
        assert_eq!(dev.expecting(), ProvPduType::Complete);
    }

    #[test]
    fn test_corrupted_confirmation_fails() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        let mut dev = DeviceSession::new(caps());
        let result = run(&mut prov, &mut dev, |bytes| {
            if bytes[0] == ProvPduType::Confirmation as u8 {
                bytes[1] ^= 0xff;
            }
        });
        assert_eq!(result.unwrap_err(), ProvisionError::ConfirmationFailed);
        assert_eq!(prov.state(), ProvisioningState::Failed);
        assert!(matches!(prov.handle(&[0x08]), Err(ProvisionError::Closed(ProvisioningState::Failed))));
    }

    #[test]
    fn test_device_rejects_corrupted_provisioner_confirmation() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        let mut dev = DeviceSession::new(caps());

        dev.handle(&encode(&prov.invite().unwrap())).unwrap();
        let caps_pdu = ProvisioningPdu::Capabilities(caps());
        let Output::Send(pdus) = prov.handle(&encode(&caps_pdu)).unwrap() else {
            panic!("expected start and public key");
        };
        assert!(dev.handle(&encode(&pdus[0])).unwrap().is_none());
        let dev_key = dev.handle(&encode(&pdus[1])).unwrap().unwrap();

        let Output::Send(pdus) = prov.handle(&encode(&dev_key)).unwrap() else {
            panic!("expected confirmation");
        };
        let mut confirmation = encode(&pdus[0]);
        confirmation[16] ^= 0x01;
        let dev_conf = dev.handle(&confirmation).unwrap().unwrap();
        let Output::Send(pdus) = prov.handle(&encode(&dev_conf)).unwrap() else {
            panic!("expected random");
        };

        let err = dev.handle(&encode(&pdus[0])).unwrap_err();
        assert_eq!(err, ProvisionError::ConfirmationFailed);
        assert_eq!(err.failure_code(), FailureCode::ConfirmationFailed);
    }

    #[test]
    fn test_unexpected_pdu_fails_session() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        prov.invite().unwrap();
        let err = prov.handle(&encode(&ProvisioningPdu::Random([0; 16]))).unwrap_err();
        assert_eq!(
            err,
            ProvisionError::UnexpectedPdu {
                state: ProvisioningState::AwaitCapabilities,
                got: ProvPduType::Random,
            }
        );
        assert_eq!(prov.state(), ProvisioningState::Failed);
    }

    #[test]
    fn test_wrong_length_fails_session() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        prov.invite().unwrap();
        let err = prov.handle(&[0x01, 0x02, 0x00]).unwrap_err();
        assert!(matches!(err, ProvisionError::Malformed(_)));
        assert_eq!(err.failure_code(), FailureCode::InvalidFormat);
        assert_eq!(prov.state(), ProvisioningState::Failed);
    }

    #[test]
    fn test_failed_pdu_ends_session() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        prov.invite().unwrap();
        let err = prov.handle(&[0x09, 0x05]).unwrap_err();
        assert_eq!(err, ProvisionError::RemoteFailed(FailureCode::OutOfResources));
        assert_eq!(prov.state(), ProvisioningState::Failed);
    }

    #[test]
    fn test_capabilities_without_elements_rejected() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        prov.invite().unwrap();
        let caps = ProvisioningPdu::Capabilities(Capabilities {
            algorithms: 1,
            ..Default::default()
        });
        assert!(matches!(prov.handle(&encode(&caps)), Err(ProvisionError::Unsupported(_))));
    }

    #[test]
    fn test_invite_only_once() {
        let mut prov = ProvisioningSession::new(Uuid::nil(), 0);
        assert_eq!(encode(&prov.invite().unwrap()), vec![0x00, 0x00]);
        assert_eq!(
            prov.invite().unwrap_err(),
            ProvisionError::Closed(ProvisioningState::AwaitCapabilities)
        );
        assert!(prov.distribute(data(1)).is_err());
    }
}
