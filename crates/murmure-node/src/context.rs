//! Root context: every long-lived component, created once and passed
//! explicitly. There is no module-level mutable state anywhere in the node.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use murmure_shared::codec::{RingCodec, SealedCodec};
use murmure_shared::DeviceKek;
use murmure_store::{load_or_create_store_key, pin_kdf_params, Database};
use murmure_tor::TorOrchestrator;

use crate::config::NodeConfig;
use crate::contacts::ContactManager;
use crate::error::Result;
use crate::inbound::InboundPipeline;
use crate::invite::InviteRegistry;
use crate::outbound::OutboundSender;
use crate::prefs::PrefStore;
use crate::replay::ReplayGuard;
use crate::vault::IdentityVault;

pub struct NodeContext {
    pub config: NodeConfig,
    pub kek: Arc<DeviceKek>,
    pub db: Arc<Mutex<Database>>,
    pub vault: Arc<IdentityVault>,
    pub contacts: Arc<ContactManager>,
    pub replay: Arc<ReplayGuard>,
    pub codec: Arc<dyn SealedCodec>,
    pub pipeline: Arc<InboundPipeline>,
    pub sender: Arc<OutboundSender>,
    pub invites: Arc<InviteRegistry>,
    pub tor: Arc<TorOrchestrator>,
    pub prefs: Arc<PrefStore>,
}

impl NodeContext {
    /// Open the store and wire every component together. Nothing is started
    /// yet; the supervisor drives lifecycles.
    pub fn bootstrap(config: NodeConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let kek = Arc::new(DeviceKek::load_or_create(&config.device_key_path())?);
        let store_key =
            load_or_create_store_key(&config.store_key_path(), &kek, config.pin.as_deref())?;
        let db = Arc::new(Mutex::new(Database::open_at(&config.db_path(), &store_key)?));

        // Keep the preference namespace in sync with the key file: the PIN
        // KDF parameters are readable there whenever PIN mode is on.
        let prefs = Arc::new(PrefStore::new(config.prefs_path()));
        let pin_kdf = pin_kdf_params(&config.store_key_path())?;
        prefs.update(|p| p.pin_kdf = pin_kdf)?;

        let vault = Arc::new(IdentityVault::new(db.clone(), kek.clone()));
        let contacts = Arc::new(ContactManager::new(db.clone()));
        let replay = Arc::new(ReplayGuard::default());
        let codec: Arc<dyn SealedCodec> = Arc::new(RingCodec::new());

        let pipeline = Arc::new(InboundPipeline::new(
            db.clone(),
            vault.clone(),
            contacts.clone(),
            replay.clone(),
            codec.clone(),
            config.strict_verified,
            config.debug,
        ));
        let sender = Arc::new(OutboundSender::new(
            db.clone(),
            vault.clone(),
            contacts.clone(),
            codec.clone(),
            config.debug,
        )?);
        let invites = Arc::new(InviteRegistry::new(db.clone(), vault.clone()));
        let tor = Arc::new(TorOrchestrator::new(config.tor_config(), kek.clone()));

        info!(data_dir = %config.data_dir.display(), "node context ready");

        Ok(Arc::new(Self {
            config,
            kek,
            db,
            vault,
            contacts,
            replay,
            codec,
            pipeline,
            sender,
            invites,
            tor,
            prefs,
        }))
    }
}
