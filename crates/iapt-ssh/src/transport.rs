//! Process-wide transport library state
//!
//! The algorithm catalog is built once per process. A failed initialization
//! is cached and reported to every later caller, and `teardown` makes all
//! later session creation fail with `LibraryUnavailable`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use iapt_core::error::TransportError;
use iapt_core::AlgorithmCategory;

use crate::backend::client::build_catalog;

static LIBRARY: OnceLock<Result<AlgorithmCatalog, String>> = OnceLock::new();
static TORN_DOWN: AtomicBool = AtomicBool::new(false);

/// Algorithms the transport library implements, per category, in default preference order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgorithmCatalog {
    pub kex: Vec<String>,
    pub host_key: Vec<String>,
    pub cipher: Vec<String>,
    pub mac: Vec<String>,
    pub compression: Vec<String>,
}

impl AlgorithmCatalog {
    pub fn get(&self, category: AlgorithmCategory) -> &[String] {
        match category {
            AlgorithmCategory::Kex => &self.kex,
            AlgorithmCategory::HostKey => &self.host_key,
            AlgorithmCategory::Cipher => &self.cipher,
            AlgorithmCategory::Mac => &self.mac,
            AlgorithmCategory::Compression => &self.compression,
        }
    }

    pub fn contains(&self, category: AlgorithmCategory, name: &str) -> bool {
        self.get(category).iter().any(|n| n == name)
    }

    /// Fails if a category has nothing to negotiate with
    pub(crate) fn validate(self) -> Result<Self, String> {
        for category in AlgorithmCategory::ALL {
            if self.get(category).is_empty() {
                return Err(format!("no {} algorithms available", category));
            }
        }
        Ok(self)
    }
}

/// Initialize the transport library, returning the algorithm catalog
pub fn initialize() -> Result<&'static AlgorithmCatalog, TransportError> {
    ensure_available()?;

    let library = LIBRARY.get_or_init(|| {
        let result = build_catalog().validate();
        match &result {
            Ok(catalog) => tracing::debug!(
                "Transport library initialized ({} kex, {} ciphers)",
                catalog.kex.len(),
                catalog.cipher.len()
            ),
            Err(e) => tracing::error!("Transport library initialization failed: {}", e),
        }
        result
    });

    library
        .as_ref()
        .map_err(|e| TransportError::LibraryUnavailable(e.clone()))
}

/// Release the transport library; later sessions cannot be created
pub fn teardown() {
    if !TORN_DOWN.swap(true, Ordering::SeqCst) {
        tracing::info!("Transport library torn down");
    }
}

/// Whether sessions can still be created
pub fn is_available() -> bool {
    !TORN_DOWN.load(Ordering::SeqCst)
}

pub(crate) fn ensure_available() -> Result<(), TransportError> {
    if is_available() {
        Ok(())
    } else {
        Err(TransportError::LibraryUnavailable(
            "transport library has been torn down".to_string(),
        ))
    }
}
