//! Bluetooth Mesh node binary.
//!
//! Runs a provisioner node and a simulated device over a pair of linked GATT
//! proxy bearers: the device is provisioned, configured with an application
//! key and an OnOff binding, then switched on and off a few times.

use anyhow::Context;
use clap::Parser;
use mesh_node::access::{CompositionData, Element, OnOffGet, OnOffSet, OnOffStatus};
use mesh_node::{MeshNode, ModelId, ModelServer};
use mesh_provision::respond;
use mesh_storage::{ApplicationKey, IvIndexState, LocalNode, MemoryKeyStore, NetworkKey};
use mesh_transport::AccessKey;
use mesh_wire::{loopback_pair, Bearer, Capabilities, PduKind, ProvisioningFlags, ProxyBearer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod logging;

use config::{parse_number, NodeConfig};
use logging::MeshLogFormatter;

const MESH_CRATES: &[&str] = &[
    "btmesh",
    "mesh_crypto",
    "mesh_wire",
    "mesh_storage",
    "mesh_network",
    "mesh_transport",
    "mesh_provision",
    "mesh_node",
];

fn parse_address(value: &str) -> anyhow::Result<u16> {
    parse_number(value)
}

/// Bluetooth Mesh node
#[derive(Parser, Debug)]
#[command(name = "btmesh", version, about = "Bluetooth Mesh node running a two-node loopback simulation")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "btmesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Unicast address of the provisioner, e.g. 0x0001
    #[arg(long, value_parser = parse_address)]
    unicast_address: Option<u16>,

    /// TTL of outgoing messages
    #[arg(long)]
    default_ttl: Option<u8>,

    /// Wait for a response to a request, e.g. 5s
    #[arg(long)]
    response_timeout: Option<humantime::Duration>,

    /// Retry loop tick of the segmented sender, e.g. 10ms
    #[arg(long)]
    retry_poll_interval: Option<humantime::Duration>,

    /// Wait for each provisioning PDU, e.g. 30s
    #[arg(long)]
    pdu_timeout: Option<humantime::Duration>,

    /// Elements of the simulated device
    #[arg(long, default_value_t = 1)]
    device_elements: u8,

    /// OnOff Set messages sent to every element
    #[arg(long, default_value_t = 4)]
    toggles: u32,

    /// Pause between toggles
    #[arg(long, default_value = "500ms")]
    toggle_interval: humantime::Duration,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(addr) = self.unicast_address {
            config.node.unicast_address = addr;
        }
        if let Some(ttl) = self.default_ttl {
            config.network.default_ttl = ttl;
        }
        if let Some(timeout) = &self.response_timeout {
            config.transport.response_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(interval) = &self.retry_poll_interval {
            config.transport.retry_poll_ms = interval.as_millis() as u64;
        }
        if let Some(timeout) = &self.pdu_timeout {
            config.provisioning.pdu_timeout_ms = timeout.as_millis() as u64;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("warn");
    for name in MESH_CRATES {
        env_filter = env_filter.add_directive(format!("{}={}", name, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(MeshLogFormatter::new("btmesh".to_string()))
        .init();

    info!("Starting btmesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    config.validate()?;

    tokio::select! {
        result = simulate(&config, &args) => result?,
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, stopping"),
    }
    info!("btmesh stopped");
    Ok(())
}

fn composition(elements: u8) -> CompositionData {
    CompositionData {
        page: 0,
        cid: 0xffff,
        pid: 0x0001,
        vid: 0x0001,
        crpl: 0x0020,
        features: 0,
        elements: (0..elements)
            .map(|i| Element {
                location: 0,
                sig_models: if i == 0 { vec![0x0000, 0x1000] } else { vec![0x1000] },
                vendor_models: vec![],
            })
            .collect(),
    }
}

async fn provisioner_store(config: &NodeConfig) -> anyhow::Result<Arc<MemoryKeyStore>> {
    let node = &config.node;
    let keys = Arc::new(
        MemoryKeyStore::new(LocalNode {
            unicast_address: node.unicast_address,
            element_count: node.element_count,
            device_key: None,
        })
        .with_low_address(config.provisioning.low_address),
    );
    keys.add_network_key(NetworkKey::new(node.net_key_index, config.net_key()?)?);
    keys.add_application_key(ApplicationKey::new(node.app_key_index, node.net_key_index, config.app_key()?)?);
    keys.set_iv_index(IvIndexState {
        index: node.iv_index,
        updating: node.iv_update,
    })
    .await;
    Ok(keys)
}

async fn simulate(config: &NodeConfig, args: &Args) -> anyhow::Result<()> {
    let prov_bearer = Arc::new(ProxyBearer::new());
    let dev_bearer = Arc::new(ProxyBearer::new());
    loopback_pair(&prov_bearer, &dev_bearer);
    dev_bearer.start()?;

    let prov_keys = provisioner_store(config).await?;
    let provisioner = MeshNode::start(
        config.mesh_node_config(config.node.unicast_address, config.node.element_count),
        prov_keys.clone(),
        prov_bearer,
    )?;

    // unprovisioned device answers the handshake on its own bearer
    let (dev_tx, mut dev_rx) = mpsc::unbounded_channel();
    dev_bearer.subscribe(PduKind::Provisioning, dev_tx);
    let caps = Capabilities {
        elements: args.device_elements,
        algorithms: 0x0001,
        ..Default::default()
    };
    let uuid = Uuid::new_v4();
    let (node, provisioned) = tokio::join!(
        provisioner.provision(uuid),
        respond(dev_bearer.as_ref(), &mut dev_rx, caps, config.pdu_timeout())
    );
    let node = node.context("provisioning failed")?;
    let provisioned = provisioned.context("device side of provisioning failed")?;
    info!(
        "Provisioned {} at {:#06x} with {} element(s)",
        uuid, node.unicast_address, node.element_count
    );

    let data = &provisioned.data;
    let dev_keys = Arc::new(MemoryKeyStore::new(LocalNode {
        unicast_address: data.unicast_address,
        element_count: args.device_elements,
        device_key: None,
    }));
    dev_keys.add_network_key(NetworkKey::new(data.key_index, data.net_key)?);
    dev_keys
        .set_iv_index(IvIndexState {
            index: data.iv_index,
            updating: data.flags.contains(ProvisioningFlags::IV_UPDATE),
        })
        .await;
    dev_keys
        .set_local_device_key(data.unicast_address, provisioned.device_key)
        .await;

    let device = Arc::new(MeshNode::start(
        config.mesh_node_config(data.unicast_address, args.device_elements),
        dev_keys.clone(),
        dev_bearer,
    )?);
    let server = ModelServer::new(
        device.clone(),
        dev_keys,
        composition(args.device_elements),
        config.network.default_ttl,
    )
    .spawn()
    .await;

    let outcome = configure_and_toggle(&provisioner, node.unicast_address, config, args).await;

    provisioner.shutdown().await;
    device.shutdown().await;
    server.abort();
    outcome
}

async fn configure_and_toggle(
    provisioner: &MeshNode,
    dst: u16,
    config: &NodeConfig,
    args: &Args,
) -> anyhow::Result<()> {
    let composition = provisioner.composition(dst).await?;
    info!(
        "Composition of {:#06x}: cid={:#06x} pid={:#06x} elements={}",
        dst,
        composition.cid,
        composition.pid,
        composition.elements.len()
    );

    let app_key_index = config.node.app_key_index;
    provisioner.add_app_key(dst, app_key_index).await?;
    for offset in 0..composition.elements.len() as u16 {
        provisioner
            .bind_model(dst, dst + offset, app_key_index, ModelId::GENERIC_ONOFF_SERVER)
            .await?;
    }

    // secondary elements get the unacknowledged set
    for round in 0..args.toggles {
        let set = OnOffSet {
            on: round % 2 == 0,
            tid: round as u8,
            transition: None,
        };
        let status: OnOffStatus = provisioner.call(dst, &set).await?;
        info!("OnOff {:#06x} is {}", dst, if status.present { "on" } else { "off" });
        for offset in 1..composition.elements.len() as u16 {
            let payload = set.to_unacknowledged_pdu()?.encode()?;
            provisioner
                .send_access(dst + offset, AccessKey::Application(app_key_index), &payload)
                .await?
                .wait()
                .await?;
        }
        tokio::time::sleep(*args.toggle_interval).await;
    }

    let status: OnOffStatus = provisioner.call(dst, &OnOffGet).await?;
    info!("Final OnOff state of {:#06x}: {}", dst, status.present);
    Ok(())
}
