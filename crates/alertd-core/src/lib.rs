//! Core alert-engine logic: wire codec, keystore, verifier, the ordered
//! alert log, execution dispatch, the retry scheduler, and genesis
//! bootstrap. No networking types leak in here — `alertd-net` owns the
//! overlay and drives these through the `AlertStore`/`KeyStore`/`NodeRpc`
//! capability traits.

pub mod bootstrap;
pub mod codec;
pub mod executor;
pub mod keystore;
pub mod retry;
pub mod schema;
pub mod store;
pub mod types;
pub mod verifier;

pub use bootstrap::{bootstrap, BootstrapError, GENESIS_TIMESTAMP};
pub use codec::{decode, encode, CodecError};
pub use executor::{ConfiscationResult, ExecutionFailed, Executor, ExecutorCtx, JsonRpcNodeClient, NodeRpc};
pub use keystore::{KeyStore, KeyStoreError, MemoryKeyStore, PublicKey, SqlKeyStore};
pub use retry::RetryScheduler;
pub use schema::ensure_schema;
pub use store::{AlertStore, SqlAlertStore, StoreError};
pub use types::*;
pub use verifier::{sign_compact, signed_digest, VerifyError, Verifier};
