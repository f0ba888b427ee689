//! The modify family: arguments, return values, and constants.

use anyhow::{Result, bail};
use tracing::debug;

use crate::bytecode::{
    constant_type, constant_value, is_constant, load_param, store_opcode, ConstantOperand,
};
use crate::descriptor::{parameter_descriptors, return_descriptor, slot_width};
use crate::directive::HandlerRef;
use crate::injectors::handler_call;
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::tree::{ClassNode, Insn};

/// ModifyArg: at method entry, pass parameter `index` through the handler
/// and store the result back into its slot. The handler signature must be
/// `(T) -> T` for the parameter type `T`.
pub fn modify_arg(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
    index: i32,
) -> Result<()> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let parameters = parameter_descriptors(&method.descriptor)?;
    if index < 0 || index as usize >= parameters.len() {
        bail!(
            "ModifyArg index {index} out of range for {} with {} parameters",
            method.key(),
            parameters.len()
        );
    }
    let param_type = parameters[index as usize].clone();
    let handler_params = parameter_descriptors(&handler.descriptor)?;
    if handler_params != [param_type.clone()]
        || return_descriptor(&handler.descriptor) != param_type
    {
        bail!(
            "ModifyArg handler {} must have signature ({param_type}){param_type}",
            handler.name
        );
    }

    let mut slot = if method.is_static() { 0u16 } else { 1 };
    for descriptor in parameters.iter().take(index as usize) {
        slot += slot_width(descriptor);
    }

    let call = handler_call(entry, handler, &class_name, &mut method);
    let mut block = call.prefix;
    block.push(load_param(&param_type, slot));
    block.push(call.invoke);
    block.push(Insn::Var { opcode: store_opcode(&param_type), var: slot });
    block.extend(method.insns.drain(..));
    method.insns = block;
    class.methods[method_index] = method;
    Ok(())
}

/// ModifyReturnValue: before each non-void RETURN, the original value is
/// duplicated into a local and passed through the handler, whose result
/// replaces it on the stack. The handler may declare additional parameters
/// mapped from the target method's own parameters.
pub fn modify_return_value(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
) -> Result<()> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let return_type = return_descriptor(&method.descriptor).to_string();
    if return_type == "V" {
        bail!("ModifyReturnValue target {} returns void", method.key());
    }
    let handler_params = parameter_descriptors(&handler.descriptor)?;
    if handler_params.first() != Some(&return_type)
        || return_descriptor(&handler.descriptor) != return_type
    {
        bail!(
            "ModifyReturnValue handler {} must take and return {return_type}",
            handler.name
        );
    }
    let target_params = parameter_descriptors(&method.descriptor)?;
    let extras = &handler_params[1..];
    if extras.len() > target_params.len()
        || extras.iter().zip(target_params.iter()).any(|(a, b)| a != b)
    {
        bail!(
            "ModifyReturnValue handler {} extra parameters must mirror the target's",
            handler.name
        );
    }

    let wide = slot_width(&return_type) == 2;
    let receiver_base = if method.is_static() { 0u16 } else { 1 };
    for return_index in method.return_indices().into_iter().rev() {
        let saved = method.new_local(slot_width(&return_type));
        let call = handler_call(entry, handler, &class_name, &mut method);
        let mut site = vec![
            Insn::Simple(if wide { opcodes::DUP2 } else { opcodes::DUP }),
            Insn::Var { opcode: store_opcode(&return_type), var: saved },
        ];
        if !call.prefix.is_empty() {
            // Instance dispatch needs the receiver below the value; drop
            // the stack copy and reload from the saved local.
            site.push(Insn::Simple(if wide { opcodes::POP2 } else { opcodes::POP }));
            site.extend(call.prefix.clone());
            site.push(load_param(&return_type, saved));
        }
        let mut extra_slot = receiver_base;
        for descriptor in extras {
            site.push(load_param(descriptor, extra_slot));
            extra_slot += slot_width(descriptor);
        }
        site.push(call.invoke);
        method.insns.splice(return_index..return_index, site);
    }
    class.methods[method_index] = method;
    Ok(())
}

fn literal_matches(value: &ConstantOperand, literal: &str) -> bool {
    match value {
        ConstantOperand::Null => literal == "null",
        ConstantOperand::Int(v) => literal.parse::<i32>() == Ok(*v),
        ConstantOperand::Long(v) => {
            literal.trim_end_matches(|c| c == 'L' || c == 'l').parse::<i64>() == Ok(*v)
        }
        ConstantOperand::Float(v) => {
            literal.trim_end_matches(|c| c == 'F' || c == 'f').parse::<f32>() == Ok(*v)
        }
        ConstantOperand::Double(v) => {
            literal.trim_end_matches(|c| c == 'D' || c == 'd').parse::<f64>() == Ok(*v)
        }
        ConstantOperand::String(v) => literal == v,
        ConstantOperand::Type(v) => literal.replace('.', "/") == *v,
    }
}

/// ModifyConstant: matching constants are passed through the handler,
/// whose result stays on the stack in their place. Only constants whose
/// type equals the handler's return type are considered; a non-empty
/// literal narrows the match further. Returns the number of rewritten
/// constants.
pub fn modify_constant(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
    literal: &str,
) -> Result<usize> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let constant_descriptor = return_descriptor(&handler.descriptor).to_string();
    let handler_params = parameter_descriptors(&handler.descriptor)?;
    if handler_params != [constant_descriptor.clone()] {
        bail!(
            "ModifyConstant handler {} must have signature ({t}){t}",
            handler.name,
            t = constant_descriptor
        );
    }

    let matches: Vec<usize> = method
        .insns
        .iter()
        .enumerate()
        .filter(|(_, insn)| {
            if !is_constant(insn) {
                return false;
            }
            if constant_type(insn).as_deref() != Some(constant_descriptor.as_str()) {
                return false;
            }
            if literal.is_empty() {
                return true;
            }
            constant_value(insn).map_or(false, |value| literal_matches(&value, literal))
        })
        .map(|(index, _)| index)
        .collect();
    let matched = matches.len();
    if matched == 0 {
        debug!(
            handler = %handler.name,
            method = %method.key(),
            "ModifyConstant matched no constants"
        );
    }

    for index in matches.into_iter().rev() {
        let call = handler_call(entry, handler, &class_name, &mut method);
        // Receiver (if any) goes under the constant, the handler call above.
        method.insns.insert(index + 1, call.invoke);
        method.insns.splice(index..index, call.prefix);
    }
    class.methods[method_index] = method;
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ALOAD, ARETURN, ASTORE, DUP, INVOKESTATIC, IRETURN, RETURN};
    use crate::test_harness::{registered_mixin, simple_mixin_class, target_with_method};
    use crate::tree::Const;

    fn static_handler(name: &str, descriptor: &str) -> HandlerRef {
        HandlerRef { name: name.to_string(), descriptor: descriptor.to_string(), is_static: true }
    }

    #[test]
    fn modify_arg_rewrites_the_parameter_slot_at_entry() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "testC0",
            "(Ljava/lang/String;)Ljava/lang/String;",
            vec![Insn::Var { opcode: ALOAD, var: 1 }, Insn::Simple(ARETURN)],
        );
        modify_arg(
            &entry,
            &mut class,
            0,
            &static_handler("prefix", "(Ljava/lang/String;)Ljava/lang/String;"),
            0,
        )
        .unwrap();
        let insns = &class.methods[0].insns;
        assert_eq!(insns[0], Insn::Var { opcode: ALOAD, var: 1 });
        assert!(matches!(
            &insns[1],
            Insn::Method { opcode: INVOKESTATIC, name, .. } if name == "prefix"
        ));
        assert_eq!(insns[2], Insn::Var { opcode: ASTORE, var: 1 });
    }

    #[test]
    fn modify_arg_rejects_out_of_range_indices_and_bad_signatures() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "go",
            "(I)V",
            vec![Insn::Simple(RETURN)],
        );
        assert!(modify_arg(&entry, &mut class, 0, &static_handler("h", "(I)I"), 3).is_err());
        assert!(modify_arg(
            &entry,
            &mut class,
            0,
            &static_handler("h", "(Ljava/lang/String;)Ljava/lang/String;"),
            0
        )
        .is_err());
    }

    #[test]
    fn modify_return_value_wraps_each_return() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "testB0",
            "()Ljava/lang/String;",
            vec![
                Insn::Ldc(Const::String("original".to_string())),
                Insn::Simple(ARETURN),
            ],
        );
        class.methods[0].access |= crate::opcodes::ACC_STATIC;
        modify_return_value(
            &entry,
            &mut class,
            0,
            &static_handler("replace", "(Ljava/lang/String;)Ljava/lang/String;"),
        )
        .unwrap();
        let insns = &class.methods[0].insns;
        assert!(matches!(insns[1], Insn::Simple(DUP)));
        assert!(matches!(insns[2], Insn::Var { opcode: ASTORE, .. }));
        assert!(matches!(
            &insns[3],
            Insn::Method { name, .. } if name == "replace"
        ));
        assert!(matches!(insns[4], Insn::Simple(ARETURN)));
    }

    #[test]
    fn modify_return_value_rejects_void_targets() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        assert!(modify_return_value(
            &entry,
            &mut class,
            0,
            &static_handler("h", "(Ljava/lang/String;)Ljava/lang/String;")
        )
        .is_err());
    }

    #[test]
    fn modify_constant_rewrites_matching_literals_only() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "pick",
            "()I",
            vec![
                Insn::Int { opcode: opcodes::SIPUSH, operand: 5000 },
                Insn::Simple(opcodes::POP),
                Insn::Int { opcode: opcodes::SIPUSH, operand: 17 },
                Insn::Simple(IRETURN),
            ],
        );
        let matched = modify_constant(
            &entry,
            &mut class,
            0,
            &static_handler("clamp", "(I)I"),
            "5000",
        )
        .unwrap();
        assert_eq!(matched, 1);
        let insns = &class.methods[0].insns;
        assert_eq!(insns[0], Insn::Int { opcode: opcodes::SIPUSH, operand: 5000 });
        assert!(matches!(&insns[1], Insn::Method { name, .. } if name == "clamp"));
        // The second constant has a different value and is untouched.
        assert_eq!(insns[3], Insn::Int { opcode: opcodes::SIPUSH, operand: 17 });
    }

    #[test]
    fn modify_constant_matches_by_type_when_no_literal_is_given() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "name",
            "()Ljava/lang/String;",
            vec![
                Insn::Ldc(Const::String("a".to_string())),
                Insn::Simple(opcodes::POP),
                Insn::Simple(opcodes::ICONST_1),
                Insn::Simple(opcodes::POP),
                Insn::Ldc(Const::String("b".to_string())),
                Insn::Simple(ARETURN),
            ],
        );
        let matched = modify_constant(
            &entry,
            &mut class,
            0,
            &static_handler("tag", "(Ljava/lang/String;)Ljava/lang/String;"),
            "",
        )
        .unwrap();
        assert_eq!(matched, 2);
    }
}
