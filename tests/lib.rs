//! Shared fixtures for PULSEWIRE integration tests.

use pulsewire_core::{ManualClock, PeerId, ProtocolConfig, ProtocolCore};
use pulsewire_crypto::x25519::PrivateKey;
use rand_core::OsRng;
use std::sync::{Arc, Once};

/// Alice's peer id
pub const ALICE: PeerId = [0xA1; 32];
/// Bob's peer id
pub const BOB: PeerId = [0xB0; 32];
/// Carol's peer id
pub const CAROL: PeerId = [0xC4; 32];

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG` (once per process).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Two connected cores sharing a manual clock.
pub struct Pair {
    /// Alice's core
    pub alice: ProtocolCore,
    /// Bob's core
    pub bob: ProtocolCore,
    /// Alice's agreement key
    pub alice_key: PrivateKey,
    /// Bob's agreement key
    pub bob_key: PrivateKey,
    /// Shared clock
    pub clock: Arc<ManualClock>,
}

impl Pair {
    /// Connected pair with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ProtocolConfig::default())
    }

    /// Connected pair with `config` on both sides.
    pub fn with_config(config: ProtocolConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::default());
        let alice = ProtocolCore::with_clock(ALICE, config.clone(), clock.clone())
            .expect("valid config");
        let bob = ProtocolCore::with_clock(BOB, config, clock.clone()).expect("valid config");

        let alice_key = PrivateKey::generate(&mut OsRng);
        let bob_key = PrivateKey::generate(&mut OsRng);
        alice
            .create_connection(&alice_key, BOB, &bob_key.public_key())
            .expect("alice connects");
        bob.create_connection(&bob_key, ALICE, &alice_key.public_key())
            .expect("bob connects");

        Self {
            alice,
            bob,
            alice_key,
            bob_key,
            clock,
        }
    }

    /// Re-key both sides with fresh agreement keys.
    pub fn rotate(&mut self) {
        self.alice_key = PrivateKey::generate(&mut OsRng);
        self.bob_key = PrivateKey::generate(&mut OsRng);
        self.alice
            .create_connection(&self.alice_key, BOB, &self.bob_key.public_key())
            .expect("alice rotates");
        self.bob
            .create_connection(&self.bob_key, ALICE, &self.alice_key.public_key())
            .expect("bob rotates");
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new()
    }
}
