//! Mixin registry: maps target-class internal names to applicable mixins.
//!
//! Two indexes are kept: an exact-name map and a list of predicate-matched
//! entries. Lookup returns predicate matches first, then exact matches,
//! each group in insertion order. Registration happens before the
//! transformer is enabled; `lookup` takes `&self` and never mutates.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::classfile;
use crate::directive::{parse_mixin, Directive, ReplaceAllMethods};
use crate::tree::ClassNode;

/// Predicate deciding whether a mixin applies to a target-class name.
pub type TargetMatcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// A registered mixin: the parsed class plus its derived directives.
#[derive(Debug)]
pub struct MixinEntry {
    pub class: ClassNode,
    pub directives: Vec<Directive>,
    pub replace_all: Option<ReplaceAllMethods>,
    /// `@Shadow` mixin methods with their target names.
    pub shadow_methods: Vec<(crate::directive::HandlerRef, String)>,
    /// `@Copy` handlers with their declared target names.
    pub copies: Vec<(crate::directive::HandlerRef, String)>,
    /// True when the mixin is a process-wide singleton object (declares a
    /// static `INSTANCE` field of its own type).
    pub singleton: bool,
}

impl MixinEntry {
    pub fn simple_name(&self) -> &str {
        self.class.simple_name()
    }
}

fn build_entry(bytes: &[u8]) -> Result<(Vec<String>, Arc<MixinEntry>)> {
    let class = classfile::parse(bytes).context("parse mixin class")?;
    let info =
        parse_mixin(&class).with_context(|| format!("parse mixin metadata of {}", class.name))?;
    let own_descriptor = format!("L{};", class.name);
    let singleton = class
        .fields
        .iter()
        .any(|field| field.name == "INSTANCE" && field.is_static() && field.descriptor == own_descriptor);
    let entry = Arc::new(MixinEntry {
        class,
        directives: info.directives,
        replace_all: info.replace_all,
        shadow_methods: info.shadow_methods,
        copies: info.copies,
        singleton,
    });
    Ok((info.targets, entry))
}

/// Process-wide mixin index.
#[derive(Default)]
pub struct MixinRegistry {
    exact: HashMap<String, Vec<Arc<MixinEntry>>>,
    matched: Vec<(TargetMatcher, Arc<MixinEntry>)>,
}

impl MixinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mixin from its classfile bytes, using the targets its
    /// `AsmMixin` annotation declares.
    pub fn register(&mut self, bytes: &[u8]) -> Result<()> {
        let (targets, entry) = build_entry(bytes)?;
        if targets.is_empty() {
            anyhow::bail!("mixin {} declares no targets", entry.class.name);
        }
        for target in targets {
            self.exact.entry(target).or_default().push(Arc::clone(&entry));
        }
        Ok(())
    }

    /// Register the class only when it carries an `AsmMixin` annotation;
    /// other classes are reported as skipped. Lets callers scan mixed
    /// directories without pre-filtering.
    pub fn register_if_mixin(&mut self, bytes: &[u8]) -> Result<bool> {
        let class = classfile::parse(bytes).context("parse candidate mixin class")?;
        let descriptor = crate::directive::api_descriptor("AsmMixin");
        if !class.annotations.iter().any(|annotation| annotation.descriptor == descriptor) {
            return Ok(false);
        }
        self.register(bytes)?;
        Ok(true)
    }

    /// Register a mixin against a name predicate instead of the annotation
    /// target list.
    pub fn register_with_matcher(&mut self, bytes: &[u8], matcher: TargetMatcher) -> Result<()> {
        let (_, entry) = build_entry(bytes)?;
        self.matched.push((matcher, entry));
        Ok(())
    }

    /// All mixins applicable to `class_name`: predicate-matched entries
    /// first, then exact matches, each group in insertion order.
    pub fn lookup(&self, class_name: &str) -> Vec<Arc<MixinEntry>> {
        let mut entries = Vec::new();
        for (matcher, entry) in &self.matched {
            if matcher(class_name) {
                entries.push(Arc::clone(entry));
            }
        }
        if let Some(exact) = self.exact.get(class_name) {
            entries.extend(exact.iter().cloned());
        }
        entries
    }

    /// Drop every entry from both indexes.
    pub fn clear(&mut self) {
        self.exact.clear();
        self.matched.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.matched.is_empty()
    }
}

impl std::fmt::Debug for MixinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixinRegistry")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field("matched", &self.matched.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::NoResolver;
    use crate::directive::api_descriptor;
    use crate::opcodes::{ACC_PUBLIC, ACC_STATIC, ACC_SUPER};
    use crate::tree::{Annotation, AnnotationValue, FieldNode};

    fn mixin_bytes(name: &str, target: &str) -> Vec<u8> {
        let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER, name);
        class.annotations.push(Annotation {
            descriptor: api_descriptor("AsmMixin"),
            visible: true,
            values: vec![(
                "targets".to_string(),
                AnnotationValue::Array(vec![AnnotationValue::Str(target.to_string())]),
            )],
        });
        classfile::write(&class, &NoResolver).unwrap()
    }

    #[test]
    fn lookup_orders_predicate_matches_before_exact_matches() {
        let mut registry = MixinRegistry::new();
        registry.register(&mixin_bytes("mixins/Exact", "com/example/Test")).unwrap();
        registry
            .register_with_matcher(
                &mixin_bytes("mixins/Matched", "unused/Name"),
                Box::new(|name| name.starts_with("com/example/")),
            )
            .unwrap();

        let entries = registry.lookup("com/example/Test");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].class.name, "mixins/Matched");
        assert_eq!(entries[1].class.name, "mixins/Exact");

        assert!(registry.lookup("other/Class").is_empty());
    }

    #[test]
    fn clear_empties_both_indexes() {
        let mut registry = MixinRegistry::new();
        registry.register(&mixin_bytes("mixins/A", "t/A")).unwrap();
        registry
            .register_with_matcher(&mixin_bytes("mixins/B", "t/B"), Box::new(|_| true))
            .unwrap();
        assert!(!registry.is_empty());
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.lookup("t/A").is_empty());
    }

    #[test]
    fn singleton_detection_requires_a_static_instance_field() {
        let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER, "mixins/Object");
        class.annotations.push(Annotation {
            descriptor: api_descriptor("AsmMixin"),
            visible: true,
            values: vec![(
                "targets".to_string(),
                AnnotationValue::Array(vec![AnnotationValue::Str("t/C".to_string())]),
            )],
        });
        class.fields.push(FieldNode {
            access: ACC_PUBLIC | ACC_STATIC | crate::opcodes::ACC_FINAL,
            name: "INSTANCE".to_string(),
            descriptor: "Lmixins/Object;".to_string(),
            signature: None,
            constant: None,
            annotations: Vec::new(),
        });
        let bytes = classfile::write(&class, &NoResolver).unwrap();

        let mut registry = MixinRegistry::new();
        registry.register(&bytes).unwrap();
        let entries = registry.lookup("t/C");
        assert!(entries[0].singleton);
    }
}
