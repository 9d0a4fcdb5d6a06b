//! Registry — a named set of instruments with optional default labels.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::instrument::Instrument;
use crate::prometheus::render_prometheus;
use crate::snapshot::{Labels, MetricFamily};

#[derive(Default)]
struct RegistryInner {
    instruments: Vec<Arc<dyn Instrument>>,
    default_labels: Labels,
}

/// Thread-safe instrument registry.
///
/// `Registry` is `Clone` (backed by `Arc`), so the same registry can be
/// handed to the cluster handle for answering peers and to the HTTP layer.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument. Names are unique per registry.
    pub fn register(&self, instrument: impl Instrument + 'static) -> RegistryResult<()> {
        self.register_shared(Arc::new(instrument))
    }

    /// Register an instrument that is already behind an `Arc`.
    pub fn register_shared(&self, instrument: Arc<dyn Instrument>) -> RegistryResult<()> {
        let name = instrument.name().to_string();
        if !is_valid_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }
        let mut inner = self.inner.write();
        if inner.instruments.iter().any(|i| i.name() == name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        inner.instruments.push(instrument);
        debug!(instrument = %name, "instrument registered");
        Ok(())
    }

    /// Labels added to every series this registry snapshots. Labels set
    /// on the series itself win.
    pub fn set_default_labels(&self, labels: Labels) {
        self.inner.write().default_labels = labels;
    }

    pub fn default_labels(&self) -> Labels {
        self.inner.read().default_labels.clone()
    }

    /// Run every instrument's collect hook, then read all of them.
    pub fn snapshots(&self) -> Vec<MetricFamily> {
        let inner = self.inner.read();
        inner
            .instruments
            .iter()
            .map(|instrument| {
                instrument.collect();
                let mut family = instrument.snapshot();
                if !inner.default_labels.is_empty() {
                    for sample in &mut family.samples {
                        for (k, v) in &inner.default_labels {
                            sample.labels.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                }
                family
            })
            .collect()
    }

    /// Prometheus text for this registry alone.
    pub fn render(&self) -> String {
        render_prometheus(&self.snapshots())
    }

    /// Names of registered instruments, in registration order.
    pub fn instrument_names(&self) -> Vec<String> {
        self.inner
            .read()
            .instruments
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every instrument and the default labels.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.instruments.clear();
        inner.default_labels.clear();
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
