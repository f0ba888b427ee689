//! Accessor and Invoker generators: synthesized members that expose
//! private state and behavior of the target class.

use anyhow::{Context, Result, bail};

use crate::bytecode::{load_param, make_return};
use crate::descriptor::{parameter_descriptors, return_descriptor, slot_width};
use crate::directive::HandlerRef;
use crate::opcodes;
use crate::tree::{ClassNode, Insn, MethodNode};

/// Field name derived from an accessor handler: the `Accessor` value if
/// present, else the handler name with its `get`/`set`/`is` prefix
/// stripped and decapitalized.
fn accessor_field_name(declared: &str, handler_name: &str) -> String {
    if !declared.is_empty() {
        return declared.to_string();
    }
    let stripped = handler_name
        .strip_prefix("get")
        .or_else(|| handler_name.strip_prefix("set"))
        .or_else(|| handler_name.strip_prefix("is"))
        .unwrap_or(handler_name);
    let mut chars = stripped.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => handler_name.to_string(),
    }
}

/// Synthesize a getter or setter for a target field. The handler shape
/// decides which: no parameters with a field-typed return is a getter,
/// a single field-typed parameter returning void is a setter.
pub fn generate_accessor(
    class: &mut ClassNode,
    handler: &HandlerRef,
    declared_field: &str,
    mutable: bool,
) -> Result<()> {
    let parameters = parameter_descriptors(&handler.descriptor)?;
    let return_type = return_descriptor(&handler.descriptor).to_string();
    let field_name = accessor_field_name(declared_field, &handler.name);
    let field_index = class
        .fields
        .iter()
        .position(|field| field.name == field_name)
        .with_context(|| format!("accessor target field {field_name} missing on {}", class.name))?;

    let (is_setter, field_type) = match (parameters.len(), return_type.as_str()) {
        (0, ret) if ret != "V" => (false, ret.to_string()),
        (1, "V") => (true, parameters[0].clone()),
        _ => bail!(
            "accessor {} must be a getter (()T) or setter ((T)V)",
            handler.name
        ),
    };
    {
        let field = &class.fields[field_index];
        if field.descriptor != field_type {
            bail!(
                "accessor {} type {field_type} does not match field {field_name}: {}",
                handler.name,
                field.descriptor
            );
        }
        let field_static = field.is_static();
        if field_static != handler.is_static {
            bail!(
                "accessor {} static-ness does not match field {field_name}",
                handler.name
            );
        }
        if is_setter && field.is_final() && !mutable {
            bail!("setter {} targets final field {field_name} without @Mutable", handler.name);
        }
    }
    if class.method(&handler.name, Some(&handler.descriptor)).is_some() {
        bail!("accessor {} collides with an existing method", handler.name);
    }

    let field_static = class.fields[field_index].is_static();
    if is_setter && mutable {
        class.fields[field_index].access &= !opcodes::ACC_FINAL;
    }

    let mut access = opcodes::ACC_PUBLIC | opcodes::ACC_SYNTHETIC;
    if field_static {
        access |= opcodes::ACC_STATIC;
    }
    let mut method = MethodNode::new(access, handler.name.clone(), handler.descriptor.clone());
    let owner = class.name.clone();
    if is_setter {
        let value_slot = if field_static { 0 } else { 1 };
        if !field_static {
            method.insns.push(Insn::Var { opcode: opcodes::ALOAD, var: 0 });
        }
        method.insns.push(load_param(&field_type, value_slot));
        method.insns.push(Insn::Field {
            opcode: if field_static { opcodes::PUTSTATIC } else { opcodes::PUTFIELD },
            owner,
            name: field_name,
            descriptor: field_type,
        });
        method.insns.push(Insn::Simple(opcodes::RETURN));
        method.max_locals = value_slot + slot_width(&parameters[0]);
    } else {
        if !field_static {
            method.insns.push(Insn::Var { opcode: opcodes::ALOAD, var: 0 });
        }
        method.insns.push(Insn::Field {
            opcode: if field_static { opcodes::GETSTATIC } else { opcodes::GETFIELD },
            owner,
            name: field_name,
            descriptor: field_type.clone(),
        });
        method.insns.push(make_return(&field_type));
        method.max_locals = if field_static { 0 } else { 1 };
    }
    class.methods.push(method);
    Ok(())
}

/// Synthesize a forwarder to a (usually private or synthetic) target
/// method with the exact same descriptor. The call opcode follows the
/// target's shape: static, constructor, interface, or private.
pub fn generate_invoker(
    class: &mut ClassNode,
    handler: &HandlerRef,
    declared_method: &str,
) -> Result<()> {
    let target_name = if declared_method.is_empty() {
        handler.name.clone()
    } else {
        declared_method.to_string()
    };
    let target = class
        .method(&target_name, Some(&handler.descriptor))
        .with_context(|| {
            format!(
                "invoker target {target_name}{} missing on {}",
                handler.descriptor, class.name
            )
        })?;
    let target_static = target.is_static();
    let target_private = target.access & opcodes::ACC_PRIVATE != 0;
    let target_constructor = target.is_constructor();
    if class.method(&handler.name, Some(&handler.descriptor)).is_some() {
        bail!("invoker {} collides with an existing method", handler.name);
    }

    let opcode = if target_static {
        opcodes::INVOKESTATIC
    } else if target_constructor || target_private {
        // Private methods on interfaces fall back to invokespecial too.
        opcodes::INVOKESPECIAL
    } else if class.is_interface() {
        opcodes::INVOKEINTERFACE
    } else {
        opcodes::INVOKEVIRTUAL
    };

    let mut access = opcodes::ACC_PUBLIC | opcodes::ACC_SYNTHETIC;
    if target_static {
        access |= opcodes::ACC_STATIC;
    }
    let mut method = MethodNode::new(access, handler.name.clone(), handler.descriptor.clone());
    let mut slot = if target_static {
        0
    } else {
        method.insns.push(Insn::Var { opcode: opcodes::ALOAD, var: 0 });
        1
    };
    for descriptor in parameter_descriptors(&handler.descriptor)? {
        method.insns.push(load_param(&descriptor, slot));
        slot += slot_width(&descriptor);
    }
    method.insns.push(Insn::Method {
        opcode,
        owner: class.name.clone(),
        name: target_name,
        descriptor: handler.descriptor.clone(),
        interface: class.is_interface(),
    });
    let return_type = return_descriptor(&handler.descriptor).to_string();
    method.insns.push(make_return(&return_type));
    method.max_locals = slot;
    class.methods.push(method);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ACC_FINAL, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC};
    use crate::test_harness::target_with_method;
    use crate::tree::FieldNode;

    fn field(name: &str, descriptor: &str, access: u16) -> FieldNode {
        FieldNode {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            signature: None,
            constant: None,
            annotations: Vec::new(),
        }
    }

    fn handler(name: &str, descriptor: &str, is_static: bool) -> HandlerRef {
        HandlerRef { name: name.to_string(), descriptor: descriptor.to_string(), is_static }
    }

    #[test]
    fn getter_and_setter_read_and_write_the_field() {
        let mut class = target_with_method(
            "t/Test",
            "noop",
            "()V",
            vec![Insn::Simple(opcodes::RETURN)],
        );
        class.fields.push(field("dynamicString", "Ljava/lang/String;", ACC_PRIVATE));

        generate_accessor(
            &mut class,
            &handler("getDynamicString", "()Ljava/lang/String;", false),
            "",
            false,
        )
        .unwrap();
        generate_accessor(
            &mut class,
            &handler("setDynamicString", "(Ljava/lang/String;)V", false),
            "",
            false,
        )
        .unwrap();

        let getter = class.method("getDynamicString", None).unwrap();
        assert_eq!(
            getter.insns,
            vec![
                Insn::Var { opcode: opcodes::ALOAD, var: 0 },
                Insn::Field {
                    opcode: opcodes::GETFIELD,
                    owner: "t/Test".to_string(),
                    name: "dynamicString".to_string(),
                    descriptor: "Ljava/lang/String;".to_string(),
                },
                Insn::Simple(opcodes::ARETURN),
            ]
        );
        let setter = class.method("setDynamicString", None).unwrap();
        assert!(setter.insns.iter().any(|insn| matches!(
            insn,
            Insn::Field { opcode: opcodes::PUTFIELD, name, .. } if name == "dynamicString"
        )));
        assert!(setter.access & opcodes::ACC_SYNTHETIC != 0);
    }

    #[test]
    fn mutable_setter_clears_the_final_flag() {
        let mut class =
            target_with_method("t/Test", "noop", "()V", vec![Insn::Simple(opcodes::RETURN)]);
        class.fields.push(field(
            "staticFinalString",
            "Ljava/lang/String;",
            ACC_PRIVATE | ACC_STATIC | ACC_FINAL,
        ));
        generate_accessor(
            &mut class,
            &handler("setStaticFinalString", "(Ljava/lang/String;)V", true),
            "staticFinalString",
            true,
        )
        .unwrap();
        assert!(!class.fields[0].is_final());
        let setter = class.method("setStaticFinalString", None).unwrap();
        assert!(setter.is_static());
        assert!(matches!(
            setter.insns[1],
            Insn::Field { opcode: opcodes::PUTSTATIC, .. }
        ));
    }

    #[test]
    fn accessor_shape_and_static_mismatches_fail() {
        let mut class =
            target_with_method("t/Test", "noop", "()V", vec![Insn::Simple(opcodes::RETURN)]);
        class.fields.push(field("s", "Ljava/lang/String;", ACC_PRIVATE));
        // instance field, static handler
        assert!(generate_accessor(
            &mut class,
            &handler("getS", "()Ljava/lang/String;", true),
            "",
            false
        )
        .is_err());
        // wrong type
        assert!(generate_accessor(&mut class, &handler("getS", "()I", false), "", false).is_err());
        // missing field
        assert!(generate_accessor(
            &mut class,
            &handler("getMissing", "()Ljava/lang/String;", false),
            "",
            false
        )
        .is_err());
        // setter on final without @Mutable
        class.fields[0].access |= ACC_FINAL;
        assert!(generate_accessor(
            &mut class,
            &handler("setS", "(Ljava/lang/String;)V", false),
            "",
            false
        )
        .is_err());
    }

    #[test]
    fn invoker_forwards_with_the_right_opcode() {
        let mut class = target_with_method(
            "t/Test",
            "hidden",
            "(I)I",
            vec![
                Insn::Var { opcode: opcodes::ILOAD, var: 1 },
                Insn::Simple(opcodes::IRETURN),
            ],
        );
        class.methods[0].access = ACC_PRIVATE;
        generate_invoker(&mut class, &handler("callHidden", "(I)I", false), "hidden").unwrap();
        let invoker = class.method("callHidden", None).unwrap();
        assert_eq!(
            invoker.insns,
            vec![
                Insn::Var { opcode: opcodes::ALOAD, var: 0 },
                Insn::Var { opcode: opcodes::ILOAD, var: 1 },
                Insn::Method {
                    opcode: opcodes::INVOKESPECIAL,
                    owner: "t/Test".to_string(),
                    name: "hidden".to_string(),
                    descriptor: "(I)I".to_string(),
                    interface: false,
                },
                Insn::Simple(opcodes::IRETURN),
            ]
        );
    }

    #[test]
    fn invoker_to_static_methods_uses_invokestatic() {
        let mut class = target_with_method(
            "t/Test",
            "util",
            "()V",
            vec![Insn::Simple(opcodes::RETURN)],
        );
        class.methods[0].access = ACC_PUBLIC | ACC_STATIC;
        generate_invoker(&mut class, &handler("callUtil", "()V", true), "util").unwrap();
        let invoker = class.method("callUtil", None).unwrap();
        assert!(invoker.is_static());
        assert!(matches!(
            invoker.insns[0],
            Insn::Method { opcode: opcodes::INVOKESTATIC, .. }
        ));
    }
}
