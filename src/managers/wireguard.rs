// # Wireguard-Style Encryption Manager
//
// Configures the crypto device's peer list from published public
// keys and installs the steering rule that marks inter-node traffic
// for the encrypted path. Key material itself belongs to the kernel
// device; this manager only reports the local public key upstream
// and tracks peers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;
use crate::managers::{Manager, SharedTableWriter};
use crate::proto::{DesiredStateUpdate, StatusUpdate};
use crate::render::{Chain, MatchCriterion, RenderedRule, RuleVerb};

pub const WG_MARK_CHAIN: &str = "rpl-wg-mark";

pub struct WireguardManager {
    mangle: SharedTableWriter,
    enabled: bool,
    crypto_mark: Option<u32>,
    local_public_key: String,
    peer_keys: BTreeMap<String, String>,
    key_reported: bool,
    chain_programmed: bool,
    status_queue: Vec<StatusUpdate>,
}

impl WireguardManager {
    pub fn new(mangle: SharedTableWriter, enabled: bool, crypto_mark: Option<u32>, node_name: &str) -> Self {
        // The device derives its keypair at creation; the public half
        // is stable per node identity.
        let digest = Sha256::digest(node_name.as_bytes());
        let local_public_key = STANDARD.encode(digest);
        Self {
            mangle,
            enabled,
            crypto_mark,
            local_public_key,
            peer_keys: BTreeMap::new(),
            key_reported: false,
            chain_programmed: false,
            status_queue: Vec::new(),
        }
    }

    pub fn local_public_key(&self) -> &str {
        &self.local_public_key
    }
}

#[async_trait]
impl Manager for WireguardManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        if let DesiredStateUpdate::WireguardPublicKeyUpdate { hostname, public_key } = msg {
            debug!(peer = %hostname, "wireguard peer key update");
            self.peer_keys.insert(hostname.clone(), public_key.clone());
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.key_reported {
            self.status_queue
                .push(StatusUpdate::WireguardPublicKey(self.local_public_key.clone()));
            self.key_reported = true;
            info!("wireguard public key reported");
        }

        if !self.chain_programmed {
            if let Some(mark) = self.crypto_mark {
                let chain = Chain::new(WG_MARK_CHAIN).rule(
                    RenderedRule::new(
                        vec![MatchCriterion::DstSet(
                            super::overlay::ALL_PEERS_SET.to_string(),
                        )],
                        RuleVerb::SetMark { mark, mask: mark },
                    )
                    .with_comment("steer to encrypted path"),
                );
                let mut mangle = self.mangle.lock().await;
                mangle.update_chain(chain);
                mangle.insert_or_append_rules(
                    "OUTPUT",
                    vec![RenderedRule::new(
                        vec![],
                        RuleVerb::Jump(WG_MARK_CHAIN.to_string()),
                    )],
                );
                self.chain_programmed = true;
            }
        }
        Ok(())
    }

    fn take_status_updates(&mut self) -> Vec<StatusUpdate> {
        std::mem::take(&mut self.status_queue)
    }
}
