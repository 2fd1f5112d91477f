//! Network and application key material.

use mesh_crypto::{k1, k2, k3, k4, s1, CryptoError, Key128};
use serde::{Deserialize, Serialize};

/// Key refresh procedure phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// No refresh in progress
    #[default]
    Normal = 0,
    /// New key distributed; old key still used to transmit
    Phase1 = 1,
    /// New key used to transmit; old key still accepted
    Phase2 = 2,
}

/// Everything derived from one 128-bit network key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetKeyMaterial {
    /// Raw key
    pub key: Key128,
    /// 7-bit identifier carried in every network PDU
    pub nid: u8,
    /// CCM key of the network layer
    pub encryption_key: Key128,
    /// Header obfuscation key
    pub privacy_key: Key128,
    /// Node identity key
    pub identity_key: Key128,
    /// Secure network beacon key
    pub beacon_key: Key128,
    /// Public network identifier
    pub network_id: [u8; 8],
}

impl NetKeyMaterial {
    /// Run the k1/k2/k3 derivations for `key`
    pub fn derive(key: Key128) -> Result<Self, CryptoError> {
        let k2_keys = k2(&key, &[0x00])?;
        let identity_key = k1(&key, &s1(b"nkik")?, b"id128\x01")?;
        let beacon_key = k1(&key, &s1(b"nkbk")?, b"id128\x01")?;
        Ok(Self {
            key,
            nid: k2_keys.nid,
            encryption_key: k2_keys.encryption_key,
            privacy_key: k2_keys.privacy_key,
            identity_key,
            beacon_key,
            network_id: k3(&key)?,
        })
    }
}

/// A network key, possibly mid key-refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkKey {
    /// 12-bit global key index
    pub index: u16,
    /// Refresh phase
    pub phase: KeyRefreshPhase,
    /// Current (new, during refresh) material
    pub current: NetKeyMaterial,
    /// Material being replaced, present during refresh
    pub old: Option<NetKeyMaterial>,
}

impl NetworkKey {
    /// Derive a network key in the normal phase
    pub fn new(index: u16, key: Key128) -> Result<Self, CryptoError> {
        Ok(Self {
            index,
            phase: KeyRefreshPhase::Normal,
            current: NetKeyMaterial::derive(key)?,
            old: None,
        })
    }

    /// Enter phase 1 with `new_key`; the present material becomes the old one
    pub fn begin_key_refresh(&mut self, new_key: Key128) -> Result<(), CryptoError> {
        let new = NetKeyMaterial::derive(new_key)?;
        self.old = Some(std::mem::replace(&mut self.current, new));
        self.phase = KeyRefreshPhase::Phase1;
        Ok(())
    }

    /// Move to `phase`; returning to normal drops the old material
    pub fn set_phase(&mut self, phase: KeyRefreshPhase) {
        self.phase = phase;
        if phase == KeyRefreshPhase::Normal {
            self.old = None;
        }
    }

    /// Material used to transmit: the old key until phase 2
    pub fn tx_material(&self) -> &NetKeyMaterial {
        match (self.phase, &self.old) {
            (KeyRefreshPhase::Phase1, Some(old)) => old,
            _ => &self.current,
        }
    }

    /// Every material whose NID matches, current first
    pub fn materials_for_nid(&self, nid: u8) -> impl Iterator<Item = &NetKeyMaterial> {
        std::iter::once(&self.current)
            .chain(self.old.iter())
            .filter(move |m| m.nid == nid)
    }
}

/// Application key plus its AID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppKeyMaterial {
    /// Raw key
    pub key: Key128,
    /// 6-bit identifier carried in the lower transport header
    pub aid: u8,
}

impl AppKeyMaterial {
    /// Run k4 for `key`
    pub fn derive(key: Key128) -> Result<Self, CryptoError> {
        Ok(Self { key, aid: k4(&key)? })
    }
}

/// An application key bound to a network key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationKey {
    /// 12-bit global key index
    pub index: u16,
    /// Index of the network key it is bound to
    pub net_key_index: u16,
    /// Current (new, during refresh) material
    pub current: AppKeyMaterial,
    /// Material being replaced, present during refresh
    pub old: Option<AppKeyMaterial>,
}

impl ApplicationKey {
    /// Derive an application key
    pub fn new(index: u16, net_key_index: u16, key: Key128) -> Result<Self, CryptoError> {
        Ok(Self {
            index,
            net_key_index,
            current: AppKeyMaterial::derive(key)?,
            old: None,
        })
    }

    /// Keep the present material as old and switch to `new_key`
    pub fn begin_key_refresh(&mut self, new_key: Key128) -> Result<(), CryptoError> {
        let new = AppKeyMaterial::derive(new_key)?;
        self.old = Some(std::mem::replace(&mut self.current, new));
        Ok(())
    }

    /// Every material whose AID matches, current first
    pub fn materials_for_aid(&self, aid: u8) -> impl Iterator<Item = &AppKeyMaterial> {
        std::iter::once(&self.current)
            .chain(self.old.iter())
            .filter(move |m| m.aid == aid)
    }
}
