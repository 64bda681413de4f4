//! # Threshold Document Sharding
//!
//! This library splits arbitrary binary documents into shards with Shamir's Secret Sharing,
//! binds every shard to one holder taken from a weight-ordered holder snapshot, and rebuilds the
//! document only once enough distinct, signed shards have been collected.
//!
//! ## Shamir's Secret Sharing over GF(2^8)
//!
//! Every byte of the document is the constant term of its own random polynomial of degree
//! `k - 1`:
//!
//! ```ignore
//! f(x) = b + a1*x + a2*x^2 + ... + a(k-1)*x^(k-1)
//! ```
//!
//! Shard `i` holds `f(i + 1)` for every byte position. With `k` points the polynomial, and hence
//! the byte, is recovered by Lagrange interpolation at `x = 0`; with fewer the byte is
//! information-theoretically hidden. The field has 255 non-zero elements, so a document is split
//! into at most 255 shards. By default `k` equals the number of shards.
//!
//! ## Holders and snapshots
//!
//! A snapshot ranks holder addresses by weight at a fixed height, ties broken by address. A
//! holder address is a libp2p peer id, so the holder's ed25519 public key is recovered from the
//! address itself and no key directory is needed. Shard `i` is assigned to the holder ranked `i`
//! and is only accepted when signed by that holder.
//!
//! ### Example: splitting and rebuilding
//!
//! ```rust
//! use std::sync::Arc;
//! use libp2p::identity::Keypair;
//! use docshard::document::Document;
//! use docshard::reconstructor::reconstruct;
//! use docshard::registry::{HolderAddress, HolderRegistry, SnapshotRef};
//! use docshard::splitter::ShardSplitter;
//! use docshard::verifier::ShardVerifier;
//!
//! let keys: Vec<Keypair> = (0..3).map(|_| Keypair::generate_ed25519()).collect();
//! let snapshot = SnapshotRef::new("ERDFA", 100);
//! let registry = Arc::new(HolderRegistry::new());
//! registry
//!     .seal(
//!         snapshot.clone(),
//!         keys.iter()
//!             .enumerate()
//!             .map(|(i, k)| (HolderAddress::new(k.public().to_peer_id()), 30 - i as u64))
//!             .collect(),
//!     )
//!     .unwrap();
//!
//! let document = Document::new(b"hello".to_vec());
//! let mut sharded = ShardSplitter::new(3)
//!     .unwrap()
//!     .shard_document(&document, &registry, &snapshot)
//!     .unwrap();
//! for (shard, key) in sharded.shards.iter_mut().zip(&keys) {
//!     shard.sign(key).unwrap();
//! }
//!
//! let verifier = ShardVerifier::new(registry.clone());
//! let rebuilt = reconstruct(&sharded, &sharded.shards, &verifier).unwrap();
//! assert_eq!(rebuilt.as_bytes(), b"hello");
//! ```
//!
//! ## Modules
//!
//! - `document`, `shard`: the document and shard data model.
//! - `registry`: holder snapshots.
//! - `sss`, `splitter`: splitting.
//! - `signing`, `verifier`: holder signatures and shard checks.
//! - `reconstructor`, `collector`: rebuilding, alone or from concurrently arriving shards.
//! - `transport`: the publish/subscribe seam and an in-process implementation.
//! - `client`, `command`, `event`, `network`, `protocol`: the libp2p implementation of the seam.
//! - `provider`, `repository`: the holder node and its shard store.

/// The `client` module defines the handle used to drive the network event loop. It implements
/// the shard transport over libp2p.
pub mod client;

/// The `collector` module gathers shards for one document from concurrent publishers and runs
/// reconstruction at most once at a time.
pub mod collector;

/// The `command` module contains the commands the client sends to the network event loop.
pub mod command;

/// The `config` module loads node configuration and the node identity key.
pub mod config;

/// The `constants` module defines various constants used in the library.
pub mod constants;

pub mod document;

pub mod error;

/// The `event` module runs the libp2p swarm and forwards inbound requests.
pub mod event;

/// The `network` module builds the libp2p swarm: Kademlia for locating holders, request/response
/// for shard exchange, identify for address discovery.
pub mod network;

/// The `protocol` module defines the request and response messages exchanged between nodes.
pub mod protocol;

/// The `provider` module implements the holder node: it signs the shards assigned to it, stores
/// them and serves them to combiners.
pub mod provider;

pub mod reconstructor;

/// The `registry` module keeps sealed holder snapshots and answers top-N queries against them.
pub mod registry;

/// The `repository` module persists shards held by a node.
pub mod repository;

pub mod shard;

pub mod signing;

pub mod splitter;

/// The `sss` (Shamir's Secret Sharing) module implements splitting and combining over GF(2^8).
pub mod sss;

pub mod transport;

pub mod verifier;
