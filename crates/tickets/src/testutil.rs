//! Fixtures for tests of the ticket subsystem.
//!
//! Feature-gated behind `testutil`.
//!
//! ```toml
//! [dev-dependencies]
//! tessera-tickets = { path = "../tickets", features = ["testutil"] }
//! ```

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tessera_storage::MemoryBackend;

use crate::{
    cipher::CipherConfig,
    clock::ManualClock,
    config::RegistryConfig,
    factory::IssueRequest,
    system::TicketSystem,
    ticket::Authentication,
};

/// Service URL used by the fixtures.
pub const APP_SERVICE: &str = "https://app.example.org";

/// An enabled cipher with fixed keys.
///
/// # Panics
///
/// Never with the fixed keys.
#[must_use]
pub fn test_cipher_config() -> CipherConfig {
    CipherConfig::builder()
        .enabled(true)
        .encryption_key(BASE64.encode([0x11u8; 32]))
        .signing_key(BASE64.encode([0x22u8; 64]))
        .build()
        .expect("fixed test keys are valid")
}

/// Default configuration with the test cipher enabled.
///
/// # Panics
///
/// Never with the fixed keys.
#[must_use]
pub fn encrypted_config() -> RegistryConfig {
    RegistryConfig::builder()
        .cipher(test_cipher_config())
        .build()
        .expect("default configuration is valid")
}

/// The authenticated principal `alice`.
#[must_use]
pub fn alice() -> Authentication {
    Authentication::builder().principal("alice").build()
}

/// A login request for `alice`.
#[must_use]
pub fn alice_login() -> IssueRequest {
    IssueRequest::builder().authentication(alice()).build()
}

/// A service ticket request against `parent` for [`APP_SERVICE`].
#[must_use]
pub fn service_request(parent: &str) -> IssueRequest {
    IssueRequest::builder().parent(parent).service(APP_SERVICE).build()
}

/// A subsystem over a sweeper-less memory backend, driven by a manual
/// clock.
///
/// # Panics
///
/// Panics if `config` does not validate.
#[must_use]
pub fn memory_system(config: &RegistryConfig) -> (TicketSystem<MemoryBackend>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let system = TicketSystem::builder()
        .backend(Arc::new(MemoryBackend::without_sweeper()))
        .config(config)
        .clock(clock.clone())
        .build()
        .expect("test configuration is valid");
    (system, clock)
}
