//! Role passwords: generation, SCRAM verifiers and Secret storage

pub mod manager;
pub mod scram;
pub mod secret_store;

pub use manager::{
    CredentialAction, CredentialError, CredentialOutcome, CredentialRequest, ensure_credential,
    rotation_due,
};
pub use scram::{ScramVerifier, password_matches};
pub use secret_store::{KubeSecretStore, SecretLocation, SecretPayload, SecretStore, SecretStoreError};
