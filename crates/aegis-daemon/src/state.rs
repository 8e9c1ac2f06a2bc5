//! Shared runtime state.
//!
//! Handlers receive `State<Arc<AppState>>`; this module owns nothing async
//! itself. The coverage snapshot and product cache are the sweeper's
//! shared handles, read on the hot path and rewritten on warm ticks.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::RwLock;

use aegis_auth::TokenSigner;
use aegis_auth::LockoutConfig;
use aegis_config::Settings;
use aegis_fines::FinePolicy;
use aegis_gateway::{AttestationVerifier, OtpDelivery, PaymentGateway};
use aegis_realtime::SessionDirectory;
use aegis_sweeper::{SharedProducts, SharedSnapshot};

/// Static build metadata included in health responses.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<Settings>,
    pub signer: Arc<TokenSigner>,
    pub lockout: Arc<LockoutConfig>,
    pub fine_policy: Arc<FinePolicy>,
    pub directory: Arc<SessionDirectory>,
    pub coverage: SharedSnapshot,
    pub products: SharedProducts,
    pub payment: Arc<dyn PaymentGateway>,
    pub otp_delivery: Arc<dyn OtpDelivery>,
    pub attestation: Arc<dyn AttestationVerifier>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        settings: Settings,
        payment: Arc<dyn PaymentGateway>,
        otp_delivery: Arc<dyn OtpDelivery>,
        attestation: Arc<dyn AttestationVerifier>,
    ) -> Self {
        let signer = Arc::new(TokenSigner::from_settings(&settings));
        let lockout = Arc::new(LockoutConfig::from_settings(&settings));
        let fine_policy = Arc::new(FinePolicy::from_settings(&settings.fines));
        Self {
            pool,
            settings: Arc::new(settings),
            signer,
            lockout,
            fine_policy,
            directory: Arc::new(SessionDirectory::new()),
            coverage: Arc::new(RwLock::new(Default::default())),
            products: Arc::new(RwLock::new(Vec::new())),
            payment,
            otp_delivery,
            attestation,
            build: BuildInfo {
                service: "aegis-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
