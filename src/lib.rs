//! OpenID Connect Federation Relying Party core for SPID/CIE.
//!
//! A web application embeds this crate to act as a federated OIDC client
//! of the Italian public-identity providers. The crate owns the hard half
//! of the problem:
//!
//! 1. Resolution and caching of signed Entity Configurations fetched from
//!    remote federation participants
//! 2. Construction and validation of a trust chain from an Identity
//!    Provider up to a recognised Trust Anchor, including metadata-policy
//!    merging
//! 3. Generation of the RP's own federation self-assertion (the
//!    well-known document), with on-demand key material and progressive
//!    onboarding
//! 4. Assembly of a signed authorization Request Object with PKCE,
//!    nonce/state and profile-specific requested claims
//!
//! HTTP serving, database backends and the token/userinfo half of the
//! flow live downstream; persistence is injected through
//! [`store::FederationStore`].

pub mod authz;
pub mod config;
pub mod entity;
pub mod errors;
pub mod fetch;
pub mod jose;
pub mod relying_party;
pub mod store;
pub mod trust;

pub use config::Config;
pub use errors::{Error, Result};
pub use relying_party::{OnboardingStep, RelyingParty, WellKnownData};
pub use store::{FederationStore, MemoryStore};
pub use trust::{MetadataType, TrustChain};
