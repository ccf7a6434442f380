//! Registry wire types and a client for fetching images from a remote
//! registry speaking the v2 distribution protocol.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod digest;
pub mod errors;
pub mod manifest;
pub mod reference;
pub mod repository;
pub mod secrets;
mod token_cache;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use digest::{Digest, Verifier};
#[doc(inline)]
pub use errors::RegistryError;
#[doc(inline)]
pub use manifest::Manifest;
#[doc(inline)]
pub use reference::Reference;
