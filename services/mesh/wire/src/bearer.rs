//! Bearer contract and the two framings used to carry mesh PDUs.
//!
//! ```text
//! advertising: [len][ad_type][payload ...]            len = 1 + payload
//! gatt proxy:  [SAR(2) | type(6)][chunk ...]          chunk <= mtu - 1
//! ```
//!
//! Bearers never interpret the PDUs they carry. Inbound PDUs are routed by
//! kind to the queues registered with [`Bearer::subscribe`]; outbound PDUs go
//! to the write handle installed with [`Bearer::set_write_handle`].

use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound sink of a bearer (radio driver, socket, loopback)
pub type WriteHandle = Arc<dyn Fn(Bytes) -> Result<(), WireError> + Send + Sync>;

/// AD type of a PB-ADV provisioning PDU
pub const AD_TYPE_PROVISION: u8 = 0x29;
/// AD type of a network PDU
pub const AD_TYPE_NETWORK: u8 = 0x2a;
/// AD type of a mesh beacon
pub const AD_TYPE_BEACON: u8 = 0x2b;

/// Legacy advertising data size
pub const ADV_DATA_SIZE: usize = 31;

/// Proxy PDU size with the default ATT MTU (23 - 3)
pub const DEFAULT_PROXY_MTU: usize = 20;

/// Largest PDU a proxy assembly may grow to: a provisioning Public Key PDU
/// (type + 64 bytes); network PDUs stop at 29
pub const MAX_PROXY_ASSEMBLY: usize = 65;

/// Kind of PDU carried by a bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduKind {
    /// Network PDU
    Network,
    /// Mesh beacon
    Beacon,
    /// Proxy configuration
    ProxyConfig,
    /// Provisioning PDU
    Provisioning,
}

impl PduKind {
    fn ad_type(self) -> Option<u8> {
        match self {
            PduKind::Network => Some(AD_TYPE_NETWORK),
            PduKind::Beacon => Some(AD_TYPE_BEACON),
            PduKind::Provisioning => Some(AD_TYPE_PROVISION),
            PduKind::ProxyConfig => None,
        }
    }

    fn from_ad_type(ad_type: u8) -> Option<Self> {
        match ad_type {
            AD_TYPE_NETWORK => Some(PduKind::Network),
            AD_TYPE_BEACON => Some(PduKind::Beacon),
            AD_TYPE_PROVISION => Some(PduKind::Provisioning),
            _ => None,
        }
    }

    fn proxy_type(self) -> u8 {
        match self {
            PduKind::Network => 0,
            PduKind::Beacon => 1,
            PduKind::ProxyConfig => 2,
            PduKind::Provisioning => 3,
        }
    }

    fn from_proxy_type(value: u8) -> Option<Self> {
        match value {
            0 => Some(PduKind::Network),
            1 => Some(PduKind::Beacon),
            2 => Some(PduKind::ProxyConfig),
            3 => Some(PduKind::Provisioning),
            _ => None,
        }
    }
}

/// Transport the network and provisioning layers write to and read from
pub trait Bearer: Send + Sync {
    /// Begin accepting and emitting PDUs
    fn start(&self) -> Result<(), WireError>;

    /// Stop; inbound PDUs are dropped and sends fail
    fn stop(&self);

    /// Inbound link-layer packet
    fn on_pdu_received(&self, data: &[u8]);

    /// Install the outbound sink
    fn set_write_handle(&self, handle: WriteHandle);

    /// Usable payload size of the underlying link
    fn set_mtu(&self, mtu: usize);

    /// Send a network PDU
    fn send_net_pdu(&self, pdu: &[u8]) -> Result<(), WireError>;

    /// Send a provisioning PDU
    fn send_prov_pdu(&self, pdu: &[u8]) -> Result<(), WireError>;

    /// Route inbound PDUs of `kind` to `sink`
    fn subscribe(&self, kind: PduKind, sink: mpsc::UnboundedSender<Bytes>);
}

struct BearerCore {
    name: &'static str,
    running: AtomicBool,
    mtu: AtomicUsize,
    write: RwLock<Option<WriteHandle>>,
    write_lock: Mutex<()>,
    sinks: RwLock<HashMap<PduKind, mpsc::UnboundedSender<Bytes>>>,
}

impl BearerCore {
    fn new(name: &'static str, mtu: usize) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            mtu: AtomicUsize::new(mtu),
            write: RwLock::new(None),
            write_lock: Mutex::new(()),
            sinks: RwLock::new(HashMap::new()),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn deliver(&self, kind: PduKind, payload: Bytes) {
        if !self.is_running() {
            debug!("{} bearer stopped, dropping {:?} pdu", self.name, kind);
            return;
        }
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        match sinks.get(&kind) {
            Some(sink) => {
                if sink.send(payload).is_err() {
                    warn!("{} bearer: {:?} queue closed", self.name, kind);
                }
            }
            None => debug!("{} bearer: no subscriber for {:?}", self.name, kind),
        }
    }

    fn write_all(&self, frames: Vec<Bytes>) -> Result<(), WireError> {
        if !self.is_running() {
            return Err(WireError::NotReady);
        }
        let handle = self
            .write
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(WireError::NotReady)?;
        // keep segments of one PDU together on the link
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for frame in frames {
            handle(frame)?;
        }
        Ok(())
    }

    fn subscribe(&self, kind: PduKind, sink: mpsc::UnboundedSender<Bytes>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, sink);
    }

    fn set_write_handle(&self, handle: WriteHandle) {
        *self.write.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// Advertising bearer: one AD structure per PDU
pub struct AdvBearer {
    core: BearerCore,
}

impl AdvBearer {
    /// Create a stopped bearer
    pub fn new() -> Self {
        Self {
            core: BearerCore::new("adv", ADV_DATA_SIZE),
        }
    }

    fn send(&self, kind: PduKind, pdu: &[u8]) -> Result<(), WireError> {
        let ad_type = kind.ad_type().ok_or(WireError::Type(kind.proxy_type()))?;
        let max_payload = self.core.mtu.load(Ordering::Relaxed).saturating_sub(2);
        if pdu.len() > max_payload {
            return Err(WireError::Size(pdu.len()));
        }
        let mut packet = BytesMut::with_capacity(pdu.len() + 2);
        packet.put_u8((pdu.len() + 1) as u8);
        packet.put_u8(ad_type);
        packet.put_slice(pdu);
        debug!("adv tx: {:02x?}", &packet[..]);
        self.core.write_all(vec![packet.freeze()])
    }
}

impl Default for AdvBearer {
    fn default() -> Self {
        Self::new()
    }
}

impl Bearer for AdvBearer {
    fn start(&self) -> Result<(), WireError> {
        self.core.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
    }

    fn on_pdu_received(&self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let len = data[offset] as usize;
            if len == 0 {
                break;
            }
            if offset + 1 + len > data.len() {
                warn!("adv rx: truncated ad structure at {}", offset);
                break;
            }
            let ad_type = data[offset + 1];
            let payload = Bytes::copy_from_slice(&data[offset + 2..offset + 1 + len]);
            match PduKind::from_ad_type(ad_type) {
                Some(kind) => self.core.deliver(kind, payload),
                None => debug!("adv rx: ignoring ad type {:#04x}", ad_type),
            }
            offset += 1 + len;
        }
    }

    fn set_write_handle(&self, handle: WriteHandle) {
        self.core.set_write_handle(handle);
    }

    fn set_mtu(&self, mtu: usize) {
        self.core.mtu.store(mtu, Ordering::Relaxed);
    }

    fn send_net_pdu(&self, pdu: &[u8]) -> Result<(), WireError> {
        self.send(PduKind::Network, pdu)
    }

    fn send_prov_pdu(&self, pdu: &[u8]) -> Result<(), WireError> {
        self.send(PduKind::Provisioning, pdu)
    }

    fn subscribe(&self, kind: PduKind, sink: mpsc::UnboundedSender<Bytes>) {
        self.core.subscribe(kind, sink);
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxySar {
    Complete = 0,
    First = 1,
    Continuation = 2,
    Last = 3,
}

struct ProxyAssembly {
    kind: PduKind,
    data: BytesMut,
}

/// GATT proxy bearer with its own link-level segmentation
pub struct ProxyBearer {
    core: BearerCore,
    assembly: Mutex<Option<ProxyAssembly>>,
}

impl ProxyBearer {
    /// Create a stopped bearer with the default MTU
    pub fn new() -> Self {
        Self {
            core: BearerCore::new("proxy", DEFAULT_PROXY_MTU),
            assembly: Mutex::new(None),
        }
    }

    fn segment(&self, kind: PduKind, pdu: &[u8]) -> Result<Vec<Bytes>, WireError> {
        let chunk_size = self.core.mtu.load(Ordering::Relaxed).saturating_sub(1);
        if chunk_size == 0 {
            return Err(WireError::Size(0));
        }
        let header = |sar: ProxySar| ((sar as u8) << 6) | kind.proxy_type();
        let frame = |sar: ProxySar, body: &[u8]| {
            let mut buf = BytesMut::with_capacity(body.len() + 1);
            buf.put_u8(header(sar));
            buf.put_slice(body);
            buf.freeze()
        };

        if pdu.len() <= chunk_size {
            return Ok(vec![frame(ProxySar::Complete, pdu)]);
        }
        let chunks: Vec<&[u8]> = pdu.chunks(chunk_size).collect();
        let last = chunks.len() - 1;
        Ok(chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let sar = match i {
                    0 => ProxySar::First,
                    i if i == last => ProxySar::Last,
                    _ => ProxySar::Continuation,
                };
                frame(sar, chunk)
            })
            .collect())
    }

    fn send(&self, kind: PduKind, pdu: &[u8]) -> Result<(), WireError> {
        let frames = self.segment(kind, pdu)?;
        debug!("proxy tx: {} bytes in {} segments", pdu.len(), frames.len());
        self.core.write_all(frames)
    }
}

impl Default for ProxyBearer {
    fn default() -> Self {
        Self::new()
    }
}

impl Bearer for ProxyBearer {
    fn start(&self) -> Result<(), WireError> {
        self.core.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        *self.assembly.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn on_pdu_received(&self, data: &[u8]) {
        let Some((&header, body)) = data.split_first() else {
            return;
        };
        let Some(kind) = PduKind::from_proxy_type(header & 0x3f) else {
            debug!("proxy rx: unknown type {:#04x}", header & 0x3f);
            return;
        };

        if body.len() > MAX_PROXY_ASSEMBLY {
            warn!("proxy rx: {} byte segment over {} bytes, dropping", body.len(), MAX_PROXY_ASSEMBLY);
            *self.assembly.lock().unwrap_or_else(PoisonError::into_inner) = None;
            return;
        }

        let complete = {
            let mut assembly = self.assembly.lock().unwrap_or_else(PoisonError::into_inner);
            match header >> 6 {
                0 => Some(Bytes::copy_from_slice(body)),
                1 => {
                    *assembly = Some(ProxyAssembly {
                        kind,
                        data: BytesMut::from(body),
                    });
                    None
                }
                sar => match assembly.as_mut() {
                    Some(partial) if partial.data.len() + body.len() > MAX_PROXY_ASSEMBLY => {
                        warn!(
                            "proxy rx: {:?} assembly over {} bytes, dropping",
                            partial.kind, MAX_PROXY_ASSEMBLY
                        );
                        *assembly = None;
                        None
                    }
                    Some(partial) if partial.kind == kind => {
                        partial.data.extend_from_slice(body);
                        if sar == ProxySar::Last as u8 {
                            assembly.take().map(|done| done.data.freeze())
                        } else {
                            None
                        }
                    }
                    _ => {
                        warn!("proxy rx: segment without start, dropping");
                        *assembly = None;
                        None
                    }
                },
            }
        };

        if let Some(pdu) = complete {
            self.core.deliver(kind, pdu);
        }
    }

    fn set_write_handle(&self, handle: WriteHandle) {
        self.core.set_write_handle(handle);
    }

    fn set_mtu(&self, mtu: usize) {
        self.core.mtu.store(mtu, Ordering::Relaxed);
    }

    fn send_net_pdu(&self, pdu: &[u8]) -> Result<(), WireError> {
        self.send(PduKind::Network, pdu)
    }

    fn send_prov_pdu(&self, pdu: &[u8]) -> Result<(), WireError> {
        self.send(PduKind::Provisioning, pdu)
    }

    fn subscribe(&self, kind: PduKind, sink: mpsc::UnboundedSender<Bytes>) {
        self.core.subscribe(kind, sink);
    }
}

/// Connect two bearers back to back: whatever one writes, the other receives
pub fn loopback_pair<A, B>(a: &Arc<A>, b: &Arc<B>)
where
    A: Bearer + 'static,
    B: Bearer + 'static,
{
    let to_b = Arc::downgrade(b);
    a.set_write_handle(Arc::new(move |frame: Bytes| -> Result<(), WireError> {
        let peer = to_b.upgrade().ok_or(WireError::NotReady)?;
        peer.on_pdu_received(&frame);
        Ok(())
    }));
    let to_a = Arc::downgrade(a);
    b.set_write_handle(Arc::new(move |frame: Bytes| -> Result<(), WireError> {
        let peer = to_a.upgrade().ok_or(WireError::NotReady)?;
        peer.on_pdu_received(&frame);
        Ok(())
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(bearer: &dyn Bearer) -> Arc<Mutex<Vec<Bytes>>> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        bearer.set_write_handle(Arc::new(move |frame: Bytes| -> Result<(), WireError> {
            sink.lock().unwrap().push(frame);
            Ok(())
        }));
        written
    }

    #[test]
    fn test_adv_framing() {
        let bearer = AdvBearer::new();
        let written = capture(&bearer);
        assert_eq!(bearer.send_net_pdu(&[1, 2, 3]), Err(WireError::NotReady));

        bearer.start().unwrap();
        bearer.send_net_pdu(&[1, 2, 3]).unwrap();
        assert_eq!(written.lock().unwrap()[0].to_vec(), vec![4, AD_TYPE_NETWORK, 1, 2, 3]);

        assert_eq!(bearer.send_prov_pdu(&[0u8; 30]), Err(WireError::Size(30)));
    }

    #[tokio::test]
    async fn test_adv_routes_by_ad_type() {
        let bearer = AdvBearer::new();
        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let (prov_tx, mut prov_rx) = mpsc::unbounded_channel();
        bearer.subscribe(PduKind::Network, net_tx);
        bearer.subscribe(PduKind::Provisioning, prov_tx);
        bearer.start().unwrap();

        // two AD structures in one packet, the second a provisioning PDU
        bearer.on_pdu_received(&[3, AD_TYPE_NETWORK, 0xaa, 0xbb, 2, AD_TYPE_PROVISION, 0x08]);
        assert_eq!(net_rx.recv().await.unwrap().to_vec(), vec![0xaa, 0xbb]);
        assert_eq!(prov_rx.recv().await.unwrap().to_vec(), vec![0x08]);

        // truncated structure is dropped
        bearer.on_pdu_received(&[9, AD_TYPE_NETWORK, 0x01]);
        assert!(net_rx.try_recv().is_err());
    }

    #[test]
    fn test_proxy_segmentation() {
        let bearer = ProxyBearer::new();
        bearer.set_mtu(5);
        let written = capture(&bearer);
        bearer.start().unwrap();

        bearer.send_prov_pdu(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        let frames: Vec<Vec<u8>> = written.lock().unwrap().iter().map(|f| f.to_vec()).collect();
        assert_eq!(
            frames,
            vec![vec![0x43, 1, 2, 3, 4], vec![0x83, 5, 6, 7, 8], vec![0xc3, 9]]
        );

        written.lock().unwrap().clear();
        bearer.send_net_pdu(&[1, 2]).unwrap();
        assert_eq!(written.lock().unwrap()[0].to_vec(), vec![0x00, 1, 2]);
    }

    #[tokio::test]
    async fn test_proxy_loopback_reassembles() {
        let a = Arc::new(ProxyBearer::new());
        let b = Arc::new(ProxyBearer::new());
        loopback_pair(&a, &b);
        let (prov_tx, mut prov_rx) = mpsc::unbounded_channel();
        b.subscribe(PduKind::Provisioning, prov_tx);
        a.start().unwrap();
        b.start().unwrap();

        let pdu: Vec<u8> = (0u8..65).collect();
        a.send_prov_pdu(&pdu).unwrap();
        assert_eq!(prov_rx.recv().await.unwrap().to_vec(), pdu);
    }

    #[tokio::test]
    async fn test_proxy_drops_orphan_segments() {
        let bearer = ProxyBearer::new();
        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        bearer.subscribe(PduKind::Network, net_tx);
        bearer.start().unwrap();

        bearer.on_pdu_received(&[0xc0, 1, 2]);
        assert!(net_rx.try_recv().is_err());

        bearer.stop();
        bearer.on_pdu_received(&[0x00, 1, 2]);
        assert!(net_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_proxy_assembly_is_capped() {
        let bearer = ProxyBearer::new();
        let (prov_tx, mut prov_rx) = mpsc::unbounded_channel();
        bearer.subscribe(PduKind::Provisioning, prov_tx);
        bearer.start().unwrap();

        // a peer that never sends LAST
        bearer.on_pdu_received(&[0x43, 0xaa, 0xbb]);
        for _ in 0..1000 {
            bearer.on_pdu_received(&[0x83; 20]);
        }
        let held = bearer
            .assembly
            .lock()
            .unwrap()
            .as_ref()
            .map(|partial| partial.data.len())
            .unwrap_or(0);
        assert!(held <= MAX_PROXY_ASSEMBLY);

        // the overflowing assembly is gone, so LAST has nothing to finish
        bearer.on_pdu_received(&[0xc3, 1]);
        assert!(prov_rx.try_recv().is_err());

        // a full-size PDU still goes through
        let pdu: Vec<u8> = (0..MAX_PROXY_ASSEMBLY as u8).collect();
        let mut first = vec![0x43];
        first.extend_from_slice(&pdu[..40]);
        let mut last = vec![0xc3];
        last.extend_from_slice(&pdu[40..]);
        bearer.on_pdu_received(&first);
        bearer.on_pdu_received(&last);
        assert_eq!(prov_rx.try_recv().unwrap().to_vec(), pdu);

        bearer.on_pdu_received(&[0x03; MAX_PROXY_ASSEMBLY + 2]);
        assert!(prov_rx.try_recv().is_err());
    }
}
