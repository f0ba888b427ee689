//! Class transformer entry point: bytes in, bytes out.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::classfile::{self, NoResolver, SuperclassResolver};
use crate::context::apply_mixin;
use crate::registry::MixinRegistry;
use crate::tree::ClassNode;

/// Applies every registered mixin to classes passed through
/// [`Transformer::transform`]. Distinct classes may be transformed from
/// different threads; the registry is only read during transformation.
pub struct Transformer {
    registry: MixinRegistry,
    resolver: Arc<dyn SuperclassResolver>,
}

impl Transformer {
    /// A transformer whose frame merges fall back to `java/lang/Object`.
    pub fn new(registry: MixinRegistry) -> Self {
        Self::with_resolver(registry, Arc::new(NoResolver))
    }

    /// A transformer resolving common superclasses through `resolver`
    /// during frame recomputation.
    pub fn with_resolver(registry: MixinRegistry, resolver: Arc<dyn SuperclassResolver>) -> Self {
        Self { registry, resolver }
    }

    pub fn registry(&self) -> &MixinRegistry {
        &self.registry
    }

    /// Transform a class if any mixin applies. Returns `None` when the
    /// class is left untouched, so callers can keep the original bytes.
    pub fn transform(&self, class_name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.registry.lookup(class_name);
        if entries.is_empty() {
            return Ok(None);
        }
        let mut class = classfile::parse(bytes)
            .with_context(|| format!("malformed classfile for {class_name}"))?;
        let changed = self.apply_entries(&mut class, class_name);
        if !changed {
            debug!(class = class_name, "mixins matched but produced no edits");
            return Ok(None);
        }
        let out = classfile::write(&class, self.resolver.as_ref())
            .with_context(|| format!("reserialize {class_name}"))?;
        Ok(Some(out))
    }

    /// Tree-level variant of [`Self::transform`], for callers that already
    /// hold a parsed class. Returns whether the tree changed.
    pub fn transform_tree(&self, class: &mut ClassNode) -> bool {
        let name = class.name.clone();
        self.apply_entries(class, &name)
    }

    fn apply_entries(&self, class: &mut ClassNode, class_name: &str) -> bool {
        let mut changed = false;
        for entry in self.registry.lookup(class_name) {
            match apply_mixin(class, &entry) {
                Ok(applied) => changed |= applied,
                Err(error) => warn!(
                    class = class_name,
                    mixin = %entry.class.name,
                    error = %format!("{error:#}"),
                    "mixin application failed, skipping"
                ),
            }
        }
        changed
    }
}
