//! Device authentication material

pub mod credentials;

pub use credentials::{CredentialProvider, CredentialSettings, StaticCredentials};
