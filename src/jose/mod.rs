//! JOSE operations: JWK sets, compact-JWS signing and verification.

pub mod jwk;
pub mod jws;

pub use jwk::{Jwk, JwkSet};
pub use jws::{decode_parts, JoseService, ENTITY_STATEMENT_TYP};
