//! Injectors: one module per directive family, sharing the emission
//! helpers in this module.
//!
//! Every injector edits a single target method (or synthesizes a new one)
//! and keeps the tree verifier-safe: fresh labels come from the owning
//! method, fresh locals grow `max_locals`, and handler dispatch goes
//! through the mixin singleton machinery instead of reflection.

pub mod accessor;
pub mod inject;
pub mod modify;
pub mod overwrite;
pub mod redirect;
pub mod replace_all;
pub mod strip;

use anyhow::{Result, bail};

use crate::bytecode::{
    box_value, default_value, load_param, method_descriptor_parse, store_opcode, unbox_value,
};
use crate::descriptor::{parameter_descriptors, return_descriptor, slot_width};
use crate::directive::{HandlerRef, Slice};
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::runtime;
use crate::tree::{Insn, MethodNode};

/// Name of the synthesized per-target mixin singleton field.
pub fn instance_field_name(mixin_simple_name: &str) -> String {
    format!("$asmInstance${mixin_simple_name}")
}

/// Instruction sequence calling a mixin handler: the dispatch prefix that
/// pushes the receiver (if any), the invocation itself, and the cleanup
/// that discards an unused handler result.
pub(crate) struct HandlerCall {
    pub prefix: Vec<Insn>,
    pub invoke: Insn,
    pub discard_result: Vec<Insn>,
}

/// Build the call to a mixin handler. A static handler is a plain
/// `invokestatic`; a singleton mixin dispatches through its `INSTANCE`
/// field; any other mixin goes through the lazily initialised
/// `$asmInstance$<Simple>` field on the target class. The lazy init is a
/// plain null check, racy under the memory model; the instance is only
/// touched by handler bodies.
pub(crate) fn handler_call(
    entry: &MixinEntry,
    handler: &HandlerRef,
    target_class_name: &str,
    method: &mut MethodNode,
) -> HandlerCall {
    let mixin_name = entry.class.name.clone();
    let mixin_descriptor = format!("L{mixin_name};");
    let (prefix, opcode) = if handler.is_static {
        (Vec::new(), opcodes::INVOKESTATIC)
    } else if entry.singleton {
        (
            vec![Insn::Field {
                opcode: opcodes::GETSTATIC,
                owner: mixin_name.clone(),
                name: "INSTANCE".to_string(),
                descriptor: mixin_descriptor,
            }],
            opcodes::INVOKEVIRTUAL,
        )
    } else {
        let field = instance_field_name(entry.simple_name());
        let initialised = method.new_label();
        let getstatic = Insn::Field {
            opcode: opcodes::GETSTATIC,
            owner: target_class_name.to_string(),
            name: field.clone(),
            descriptor: mixin_descriptor.clone(),
        };
        (
            vec![
                getstatic.clone(),
                Insn::Jump { opcode: opcodes::IFNONNULL, label: initialised },
                Insn::Type { opcode: opcodes::NEW, class_name: mixin_name.clone() },
                Insn::Simple(opcodes::DUP),
                Insn::Method {
                    opcode: opcodes::INVOKESPECIAL,
                    owner: mixin_name.clone(),
                    name: "<init>".to_string(),
                    descriptor: "()V".to_string(),
                    interface: false,
                },
                Insn::Field {
                    opcode: opcodes::PUTSTATIC,
                    owner: target_class_name.to_string(),
                    name: field,
                    descriptor: mixin_descriptor,
                },
                Insn::Label(initialised),
                getstatic,
            ],
            opcodes::INVOKEVIRTUAL,
        )
    };
    let handler_return = return_descriptor(&handler.descriptor);
    let discard_result = match handler_return.as_bytes().first() {
        Some(b'V') => Vec::new(),
        Some(b'J') | Some(b'D') => vec![Insn::Simple(opcodes::POP2)],
        _ => vec![Insn::Simple(opcodes::POP)],
    };
    HandlerCall {
        prefix,
        invoke: Insn::Method {
            opcode,
            owner: mixin_name,
            name: handler.name.clone(),
            descriptor: handler.descriptor.clone(),
            interface: false,
        },
        discard_result,
    }
}

/// True when the handler's first parameter asks for a `CallbackInfo`.
pub(crate) fn wants_callback_info(handler: &HandlerRef) -> Result<bool> {
    let parameters = parameter_descriptors(&handler.descriptor)?;
    Ok(parameters.first().map(String::as_str) == Some(runtime::CALLBACK_INFO_DESCRIPTOR))
}

/// Instructions building a fresh `CallbackInfo` into a new local slot.
pub(crate) fn new_callback_info(method: &mut MethodNode) -> (u16, Vec<Insn>) {
    let local = method.new_local(1);
    let insns = vec![
        Insn::Type { opcode: opcodes::NEW, class_name: runtime::CALLBACK_INFO.to_string() },
        Insn::Simple(opcodes::DUP),
        Insn::Method {
            opcode: opcodes::INVOKESPECIAL,
            owner: runtime::CALLBACK_INFO.to_string(),
            name: "<init>".to_string(),
            descriptor: "()V".to_string(),
            interface: false,
        },
        Insn::Var { opcode: opcodes::ASTORE, var: local },
    ];
    (local, insns)
}

/// Does an invocation instruction match an `owner.name(descriptor)`
/// reference? Empty owner/descriptor parts match anything; the name is
/// required.
pub(crate) fn invoke_matches(insn: &Insn, target: &str) -> bool {
    let (owner, name, descriptor) = method_descriptor_parse(target);
    match insn {
        Insn::Method { owner: call_owner, name: call_name, descriptor: call_descriptor, .. } => {
            !name.is_empty()
                && *call_name == name
                && (owner.is_empty() || *call_owner == owner)
                && (descriptor.is_empty() || *call_descriptor == descriptor)
        }
        _ => false,
    }
}

/// Instruction-index window selected by a `Slice`, as `[start, end)`.
pub(crate) fn slice_window(insns: &[Insn], slice: &Slice) -> (usize, usize) {
    let start = slice
        .from
        .as_ref()
        .and_then(|at| insns.iter().position(|insn| invoke_matches(insn, &at.target)))
        .unwrap_or(0);
    let end = slice
        .to
        .as_ref()
        .and_then(|at| {
            insns[start..]
                .iter()
                .position(|insn| invoke_matches(insn, &at.target))
                .map(|index| start + index)
        })
        .unwrap_or(insns.len());
    (start, end)
}

/// A call's operand values spilled into fresh locals.
pub(crate) struct SavedCall {
    /// Stores draining the stack, last argument first.
    pub stores: Vec<Insn>,
    /// Loads restoring the stack in call order.
    pub loads: Vec<Insn>,
    /// `(slot, descriptor)` in call order, receiver first when present.
    pub slots: Vec<(u16, String)>,
}

/// Spill a call's receiver and arguments into fresh locals.
pub(crate) fn save_call_values(
    method: &mut MethodNode,
    receiver: Option<String>,
    parameters: &[String],
) -> SavedCall {
    let mut slots = Vec::new();
    if let Some(descriptor) = receiver {
        let slot = method.new_local(1);
        slots.push((slot, descriptor));
    }
    for descriptor in parameters {
        let slot = method.new_local(slot_width(descriptor));
        slots.push((slot, descriptor.clone()));
    }
    let stores = slots
        .iter()
        .rev()
        .map(|(slot, descriptor)| Insn::Var { opcode: store_opcode(descriptor), var: *slot })
        .collect();
    let loads = slots
        .iter()
        .map(|(slot, descriptor)| load_param(descriptor, *slot))
        .collect();
    SavedCall { stores, loads, slots }
}

impl SavedCall {
    /// Loads for the first `count` saved values, for handlers that declare
    /// a prefix of the call operands as parameters.
    pub(crate) fn load_prefix(&self, count: usize) -> Result<Vec<Insn>> {
        if count > self.slots.len() {
            bail!(
                "handler declares {count} parameters but the call site only carries {}",
                self.slots.len()
            );
        }
        Ok(self
            .slots
            .iter()
            .take(count)
            .map(|(slot, descriptor)| load_param(descriptor, *slot))
            .collect())
    }
}

/// Instructions coercing a value of type `from` into type `to` on the
/// operand stack: boxing, unboxing, checkcasts, defaults for void-to-value
/// and pops for value-to-void.
pub(crate) fn coerce_return(from: &str, to: &str) -> Result<Vec<Insn>> {
    if from == to {
        return Ok(Vec::new());
    }
    if to.starts_with('V') {
        let pop = match slot_width(from) {
            2 => Insn::Simple(opcodes::POP2),
            _ => Insn::Simple(opcodes::POP),
        };
        return Ok(vec![pop]);
    }
    if from.starts_with('V') {
        return Ok(default_value(to));
    }
    let from_primitive = !from.starts_with('L') && !from.starts_with('[');
    let to_primitive = !to.starts_with('L') && !to.starts_with('[');
    match (from_primitive, to_primitive) {
        (true, true) => bail!("cannot adapt primitive `{from}` to primitive `{to}`"),
        (false, true) => Ok(unbox_value(to)),
        (true, false) => {
            let mut insns = box_value(from);
            if to != "Ljava/lang/Object;" {
                insns.extend(unbox_value(to));
            }
            Ok(insns)
        }
        (false, false) => Ok(unbox_value(to)),
    }
}
