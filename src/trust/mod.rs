//! Trust-chain establishment: the upward walk and metadata-policy merging.

pub mod chain;
pub mod policy;

pub use chain::{ChainStatus, MetadataType, TrustChain, TrustChainBuilder};
