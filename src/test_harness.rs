//! Shared fixtures for unit tests: target classes built directly as trees
//! and mixin classes round-tripped through the crate's own writer and
//! reader, so registration exercises the real classfile path.

use std::sync::Arc;

use crate::classfile::{self, NoResolver};
use crate::directive::{api_descriptor, Directive};
use crate::opcodes::{ACC_PUBLIC, ACC_SUPER};
use crate::registry::{MixinEntry, MixinRegistry};
use crate::tree::{Annotation, AnnotationValue, ClassNode, Insn, MethodNode};

/// A target class with a single public method carrying the given body.
pub(crate) fn target_with_method(
    class_name: &str,
    name: &str,
    descriptor: &str,
    insns: Vec<Insn>,
) -> ClassNode {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER, class_name);
    let mut method = MethodNode::new(ACC_PUBLIC, name, descriptor);
    method.insns = insns;
    let params = crate::descriptor::parameter_slots(descriptor).unwrap_or(0);
    method.max_locals = params + 1;
    class.methods.push(method);
    class
}

/// A minimal mixin class annotated to target `t/Target`.
pub(crate) fn simple_mixin_class(name: &str) -> ClassNode {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER, name);
    class.annotations.push(Annotation {
        descriptor: api_descriptor("AsmMixin"),
        visible: true,
        values: vec![(
            "targets".to_string(),
            AnnotationValue::Array(vec![AnnotationValue::Str("t/Target".to_string())]),
        )],
    });
    class
}

/// A mixin class carrying one handler method with the given body.
pub(crate) fn mixin_with_handler(
    class_name: &str,
    name: &str,
    descriptor: &str,
    access: u16,
    insns: Vec<Insn>,
) -> ClassNode {
    let mut class = simple_mixin_class(class_name);
    let mut handler = MethodNode::new(access, name, descriptor);
    handler.insns = insns;
    let params = crate::descriptor::parameter_slots(descriptor).unwrap_or(0);
    handler.max_locals = params + 1;
    class.methods.push(handler);
    class
}

/// Register the class through the real write/parse path and hand back its
/// entry.
pub(crate) fn registered_mixin(class: ClassNode) -> Arc<MixinEntry> {
    let bytes = classfile::write(&class, &NoResolver).expect("write mixin fixture");
    let mut registry = MixinRegistry::new();
    registry.register(&bytes).expect("register mixin fixture");
    registry.lookup("t/Target").remove(0)
}

/// An entry with hand-assembled directives, bypassing annotation parsing.
pub(crate) fn mixin_entry_with(class: ClassNode, directives: Vec<Directive>) -> Arc<MixinEntry> {
    Arc::new(MixinEntry {
        class,
        directives,
        replace_all: None,
        shadow_methods: Vec::new(),
        copies: Vec::new(),
        singleton: false,
    })
}
