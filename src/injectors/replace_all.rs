//! ReplaceAllMethods: every method body becomes a stub that forwards the
//! invocation through the runtime dispatch surface.

use anyhow::Result;

use crate::bytecode::{box_value, load_param, make_return, unbox_value};
use crate::descriptor::{parameter_descriptors, return_descriptor, slot_width};
use crate::directive::ReplaceAllMethods;
use crate::injectors::strip::strip_synchronization;
use crate::opcodes;
use crate::runtime;
use crate::tree::{ClassNode, Const, Insn, MethodNode};

/// Push a small non-negative int with the narrowest encoding.
fn push_int(value: i32) -> Insn {
    match value {
        0..=5 => Insn::Simple(opcodes::ICONST_0 + value as u8),
        -128..=127 => Insn::Int { opcode: opcodes::BIPUSH, operand: value },
        -32768..=32767 => Insn::Int { opcode: opcodes::SIPUSH, operand: value },
        _ => Insn::Ldc(Const::Int(value)),
    }
}

/// Push the `java/lang/Class` for a return descriptor: primitive TYPE
/// fields for primitives and void, class literals otherwise.
fn push_class_literal(descriptor: &str) -> Insn {
    let wrapper = match descriptor.as_bytes().first() {
        Some(b'V') => Some("java/lang/Void"),
        Some(b'Z') => Some("java/lang/Boolean"),
        Some(b'B') => Some("java/lang/Byte"),
        Some(b'C') => Some("java/lang/Character"),
        Some(b'S') => Some("java/lang/Short"),
        Some(b'I') => Some("java/lang/Integer"),
        Some(b'J') => Some("java/lang/Long"),
        Some(b'F') => Some("java/lang/Float"),
        Some(b'D') => Some("java/lang/Double"),
        _ => None,
    };
    match wrapper {
        Some(owner) => Insn::Field {
            opcode: opcodes::GETSTATIC,
            owner: owner.to_string(),
            name: "TYPE".to_string(),
            descriptor: "Ljava/lang/Class;".to_string(),
        },
        None => Insn::Ldc(Const::Class(crate::bytecode::descriptor_to_internal(descriptor))),
    }
}

/// The forwarding call: receiver-or-class-literal, the owner-and-descriptor
/// string, the return-type class, and the boxed argument array, handed to
/// `Dispatch.invokeIgnore`. The result is left on the stack as
/// `java/lang/Object`.
fn forwarding_call(class_name: &str, method: &MethodNode) -> Result<Vec<Insn>> {
    let parameters = parameter_descriptors(&method.descriptor)?;
    let return_type = return_descriptor(&method.descriptor);
    let mut insns = Vec::new();
    if method.is_static() {
        insns.push(Insn::Ldc(Const::Class(class_name.to_string())));
    } else {
        insns.push(Insn::Var { opcode: opcodes::ALOAD, var: 0 });
    }
    insns.push(Insn::Ldc(Const::String(format!(
        "{class_name}.{}{}",
        method.name, method.descriptor
    ))));
    insns.push(push_class_literal(return_type));
    insns.push(push_int(parameters.len() as i32));
    insns.push(Insn::Type {
        opcode: opcodes::ANEWARRAY,
        class_name: "java/lang/Object".to_string(),
    });
    let mut slot = if method.is_static() { 0u16 } else { 1 };
    for (index, descriptor) in parameters.iter().enumerate() {
        insns.push(Insn::Simple(opcodes::DUP));
        insns.push(push_int(index as i32));
        insns.push(load_param(descriptor, slot));
        insns.extend(box_value(descriptor));
        insns.push(Insn::Simple(opcodes::AASTORE));
        slot += slot_width(descriptor);
    }
    insns.push(Insn::Method {
        opcode: opcodes::INVOKESTATIC,
        owner: runtime::DISPATCH.to_string(),
        name: "invokeIgnore".to_string(),
        descriptor: runtime::INVOKE_DESCRIPTOR.to_string(),
        interface: false,
    });
    Ok(insns)
}

/// Apply the directive to every eligible method of the class, per the
/// interface/abstract/constructor rules. Returns the number of methods
/// rewritten.
pub fn replace_all_methods(
    class: &mut ClassNode,
    directive: &ReplaceAllMethods,
) -> Result<usize> {
    let class_name = class.name.clone();
    let is_interface = class.is_interface();
    let mut rewritten = 0usize;

    for method in &mut class.methods {
        if method.name == "<clinit>" {
            continue;
        }
        if method.is_constructor() {
            if method.descriptor != "()V" || !method.has_code() {
                continue;
            }
            // Forward before the terminal RETURN so initialization order
            // is preserved, and open the constructor up.
            let mut call = forwarding_call(&class_name, method)?;
            call.push(Insn::Simple(opcodes::POP));
            if let Some(last_return) = method.return_indices().into_iter().last() {
                method.insns.splice(last_return..last_return, call);
            }
            method.access &= !(opcodes::ACC_PRIVATE | opcodes::ACC_PROTECTED);
            method.access |= opcodes::ACC_PUBLIC;
            if directive.remove_sync {
                strip_synchronization(&mut method.insns);
                method.access &= !opcodes::ACC_SYNCHRONIZED;
            }
            rewritten += 1;
            continue;
        }
        if is_interface && !method.is_static() && method.is_abstract() {
            continue;
        }

        let return_type = return_descriptor(&method.descriptor).to_string();
        let mut body = forwarding_call(&class_name, method)?;
        body.extend(unbox_value(&return_type));
        body.push(make_return(&return_type));

        method.insns = body;
        method.try_catch.clear();
        method.locals.clear();
        method.access &= !(opcodes::ACC_ABSTRACT | opcodes::ACC_NATIVE);
        if directive.remove_sync {
            method.access &= !opcodes::ACC_SYNCHRONIZED;
        }
        let params = crate::descriptor::parameter_slots(&method.descriptor)?;
        method.max_locals = params + if method.is_static() { 0 } else { 1 };
        rewritten += 1;
    }

    for field in &mut class.fields {
        if !field.is_static() {
            field.access &= !opcodes::ACC_FINAL;
        }
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{
        ACC_ABSTRACT, ACC_FINAL, ACC_INTERFACE, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ALOAD,
        ARETURN, INVOKESPECIAL, RETURN,
    };
    use crate::test_harness::target_with_method;
    use crate::tree::FieldNode;

    #[test]
    fn bodies_become_dispatch_stubs() {
        let mut class = target_with_method(
            "t/T",
            "testC0",
            "(Ljava/lang/String;)Ljava/lang/String;",
            vec![Insn::Var { opcode: ALOAD, var: 1 }, Insn::Simple(ARETURN)],
        );
        let rewritten =
            replace_all_methods(&mut class, &ReplaceAllMethods::default()).unwrap();
        assert_eq!(rewritten, 1);
        let insns = &class.methods[0].insns;
        assert_eq!(insns[0], Insn::Var { opcode: ALOAD, var: 0 });
        assert!(matches!(
            &insns[1],
            Insn::Ldc(Const::String(key)) if key == "t/T.testC0(Ljava/lang/String;)Ljava/lang/String;"
        ));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { owner, name, .. }
                if owner == runtime::DISPATCH && name == "invokeIgnore"
        )));
        // Return value comes back through a checkcast.
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Type { opcode: opcodes::CHECKCAST, class_name } if class_name == "java/lang/String"
        )));
    }

    #[test]
    fn nullary_constructors_forward_before_the_terminal_return() {
        let mut class = target_with_method(
            "t/T",
            "<init>",
            "()V",
            vec![
                Insn::Var { opcode: ALOAD, var: 0 },
                Insn::Method {
                    opcode: INVOKESPECIAL,
                    owner: "java/lang/Object".to_string(),
                    name: "<init>".to_string(),
                    descriptor: "()V".to_string(),
                    interface: false,
                },
                Insn::Simple(RETURN),
            ],
        );
        class.methods[0].access = ACC_PRIVATE;
        replace_all_methods(&mut class, &ReplaceAllMethods::default()).unwrap();
        let method = &class.methods[0];
        // Promoted to public, super call preserved, dispatch before return.
        assert!(method.access & ACC_PUBLIC != 0);
        assert!(method.access & ACC_PRIVATE == 0);
        assert!(matches!(method.insns[1], Insn::Method { opcode: INVOKESPECIAL, .. }));
        let dispatch_position = method
            .insns
            .iter()
            .position(|insn| matches!(insn, Insn::Method { name, .. } if name == "invokeIgnore"))
            .unwrap();
        let return_position =
            method.insns.iter().position(|insn| matches!(insn, Insn::Simple(RETURN))).unwrap();
        assert!(dispatch_position < return_position);
    }

    #[test]
    fn interfaces_keep_abstract_instance_methods() {
        let mut class = target_with_method("t/I", "stat", "()V", vec![Insn::Simple(RETURN)]);
        class.access |= ACC_INTERFACE;
        class.methods[0].access = ACC_PUBLIC | ACC_STATIC;
        let mut abstract_method = MethodNode::new(ACC_PUBLIC | ACC_ABSTRACT, "virt", "()V");
        abstract_method.insns = Vec::new();
        class.methods.push(abstract_method);

        let rewritten =
            replace_all_methods(&mut class, &ReplaceAllMethods::default()).unwrap();
        assert_eq!(rewritten, 1);
        assert!(class.methods[1].is_abstract());
        assert!(!class.methods[1].has_code());
    }

    #[test]
    fn instance_fields_lose_final() {
        let mut class = target_with_method("t/T", "m", "()V", vec![Insn::Simple(RETURN)]);
        class.fields.push(FieldNode {
            access: ACC_PRIVATE | ACC_FINAL,
            name: "a".to_string(),
            descriptor: "I".to_string(),
            signature: None,
            constant: None,
            annotations: Vec::new(),
        });
        class.fields.push(FieldNode {
            access: ACC_PRIVATE | ACC_STATIC | ACC_FINAL,
            name: "b".to_string(),
            descriptor: "I".to_string(),
            signature: None,
            constant: None,
            annotations: Vec::new(),
        });
        replace_all_methods(&mut class, &ReplaceAllMethods::default()).unwrap();
        assert!(!class.fields[0].is_final());
        assert!(class.fields[1].is_final());
    }

    #[test]
    fn primitive_returns_unbox_from_the_dispatch_result() {
        let mut class = target_with_method(
            "t/T",
            "count",
            "()I",
            vec![Insn::Simple(opcodes::ICONST_0), Insn::Simple(opcodes::IRETURN)],
        );
        class.methods[0].access = ACC_PUBLIC | ACC_STATIC;
        replace_all_methods(&mut class, &ReplaceAllMethods::default()).unwrap();
        let insns = &class.methods[0].insns;
        // Static receiver is the class literal.
        assert!(matches!(&insns[0], Insn::Ldc(Const::Class(name)) if name == "t/T"));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Field { name, owner, .. } if name == "TYPE" && owner == "java/lang/Integer"
        )));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { name, .. } if name == "intValue"
        )));
        assert!(matches!(insns.last(), Some(Insn::Simple(opcodes::IRETURN))));
    }
}
