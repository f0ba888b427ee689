//! Overwrite and Copy: whole-body replacement from the mixin classfile.

use anyhow::{Context, Result};
use tracing::warn;

use crate::descriptor::{parameter_slots, return_descriptor};
use crate::directive::{HandlerRef, MethodKey};
use crate::inline::{copy_handler_body, ReturnHandling};
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::tree::{ClassNode, MethodNode};

fn source_handler<'a>(entry: &'a MixinEntry, handler: &HandlerRef) -> Result<&'a MethodNode> {
    entry
        .class
        .method(&handler.name, Some(&handler.descriptor))
        .with_context(|| format!("handler {} missing from mixin {}", handler.name, entry.class.name))
}

/// Overwrite: the target method's body, locals, try/catch ranges and
/// parameter metadata are discarded and replaced with the handler's body,
/// adapted to the target frame.
pub fn overwrite(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
) -> Result<()> {
    let mut method = class.methods[method_index].clone();
    let source = source_handler(entry, handler)?.clone();

    method.insns.clear();
    method.locals.clear();
    method.try_catch.clear();
    method.parameters.clear();
    method.max_locals = 0;
    method.access &= !(opcodes::ACC_ABSTRACT | opcodes::ACC_NATIVE);

    let return_type = return_descriptor(&method.descriptor).to_string();
    let body = copy_handler_body(
        entry,
        &source,
        class,
        &mut method,
        ReturnHandling::Adapt(&return_type),
    )?;
    method.insns = body.insns;
    method.try_catch = body.try_catch;
    let param_slots = parameter_slots(&method.descriptor)?;
    method.recompute_max_locals(param_slots);
    class.methods[method_index] = method;
    Ok(())
}

/// Copy: a new method with the declared key is added to the target class,
/// carrying the handler's body. Refuses (with a warning) when the key
/// already exists. Returns whether the method was added.
pub fn copy(
    entry: &MixinEntry,
    class: &mut ClassNode,
    handler: &HandlerRef,
    key: &MethodKey,
) -> Result<bool> {
    let descriptor = key.descriptor.clone().unwrap_or_else(|| handler.descriptor.clone());
    if class.method(&key.name, Some(&descriptor)).is_some() {
        warn!(
            class = %class.name,
            method = %format!("{}{descriptor}", key.name),
            "copy target already exists, skipping"
        );
        return Ok(false);
    }
    let source = source_handler(entry, handler)?.clone();
    let access = (source.access & !(opcodes::ACC_ABSTRACT | opcodes::ACC_NATIVE))
        | opcodes::ACC_SYNTHETIC;
    let mut method = MethodNode::new(access, key.name.clone(), descriptor);
    let return_type = return_descriptor(&method.descriptor).to_string();
    let body = copy_handler_body(
        entry,
        &source,
        class,
        &mut method,
        ReturnHandling::Adapt(&return_type),
    )?;
    method.insns = body.insns;
    method.try_catch = body.try_catch;
    let param_slots = parameter_slots(&method.descriptor)?;
    method.recompute_max_locals(param_slots);
    class.methods.push(method);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ACC_PUBLIC, ACC_STATIC, ARETURN};
    use crate::test_harness::{mixin_with_handler, registered_mixin, target_with_method};
    use crate::tree::{Const, Insn};

    fn overwrite_handler() -> (std::sync::Arc<MixinEntry>, HandlerRef) {
        let entry = registered_mixin(mixin_with_handler(
            "m/M",
            "testB0",
            "()Ljava/lang/String;",
            ACC_PUBLIC | ACC_STATIC,
            vec![
                Insn::Ldc(Const::String("OverwrittenB0".to_string())),
                Insn::Simple(ARETURN),
            ],
        ));
        let handler = HandlerRef {
            name: "testB0".to_string(),
            descriptor: "()Ljava/lang/String;".to_string(),
            is_static: true,
        };
        (entry, handler)
    }

    #[test]
    fn overwrite_replaces_the_whole_body() {
        let (entry, handler) = overwrite_handler();
        let mut class = target_with_method(
            "t/T",
            "testB0",
            "()Ljava/lang/String;",
            vec![
                Insn::Field {
                    opcode: crate::opcodes::GETSTATIC,
                    owner: "t/T".to_string(),
                    name: "staticFinalString".to_string(),
                    descriptor: "Ljava/lang/String;".to_string(),
                },
                Insn::Simple(ARETURN),
            ],
        );
        class.methods[0].access = ACC_PUBLIC | ACC_STATIC;
        overwrite(&entry, &mut class, 0, &handler).unwrap();
        assert_eq!(
            class.methods[0].insns,
            vec![
                Insn::Ldc(Const::String("OverwrittenB0".to_string())),
                Insn::Simple(ARETURN),
            ]
        );
    }

    #[test]
    fn overwrite_clears_abstract_and_native() {
        let (entry, handler) = overwrite_handler();
        let mut class =
            target_with_method("t/T", "testB0", "()Ljava/lang/String;", Vec::new());
        class.methods[0].access = ACC_PUBLIC | ACC_STATIC | crate::opcodes::ACC_ABSTRACT;
        overwrite(&entry, &mut class, 0, &handler).unwrap();
        assert!(!class.methods[0].is_abstract());
        assert!(class.methods[0].has_code());
    }

    #[test]
    fn copy_adds_a_new_method_once() {
        let (entry, handler) = overwrite_handler();
        let mut class = target_with_method(
            "t/T",
            "existing",
            "()V",
            vec![Insn::Simple(crate::opcodes::RETURN)],
        );
        let key = MethodKey {
            name: "copied".to_string(),
            descriptor: Some("()Ljava/lang/String;".to_string()),
        };
        assert!(copy(&entry, &mut class, &handler, &key).unwrap());
        assert_eq!(class.methods.len(), 2);
        assert_eq!(class.methods[1].name, "copied");
        assert!(class.methods[1].access & crate::opcodes::ACC_SYNTHETIC != 0);
        // A second copy with the same key is refused.
        assert!(!copy(&entry, &mut class, &handler, &key).unwrap());
        assert_eq!(class.methods.len(), 2);
    }
}
