//! Inline code generator: clones a mixin handler body into a target
//! method's frame.
//!
//! The clone gets fresh labels, its local indices are remapped onto the
//! target frame, member references against the mixin class are rebound to
//! the target class (shadow and copy declarations), and singleton
//! `INSTANCE` dispatch is promoted to static calls where the target frame
//! is static.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};

use crate::bytecode::{default_value, insn_stack_delta, make_return};
use crate::descriptor::{parameter_descriptors, parameter_slots, return_descriptor, slot_width};
use crate::directive::shadow_target_name;
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::tree::{clone_with_fresh_labels, ClassNode, Insn, LabelId, MethodNode, TryCatch};

/// What to do with RETURN instructions in the copied body.
pub enum ReturnHandling<'a> {
    /// Adapt to the target method's return descriptor: keep matching
    /// returns, rewrite mismatched ones to pop-default-return.
    Adapt(&'a str),
    /// Replace every RETURN with a jump (inline injection into the middle
    /// of a method; the handler must be void).
    JumpTo(LabelId),
}

/// A handler body adapted to the target frame.
pub struct AdaptedBody {
    pub insns: Vec<Insn>,
    pub try_catch: Vec<TryCatch>,
}

/// Bound on the singleton-promotion lookahead. Arbitrary; call shapes
/// beyond it are left untouched.
const PROMOTION_LOOKAHEAD: usize = 100;

/// Clone `handler`'s body out of the mixin class and adapt it to
/// `target_method`'s frame.
pub fn copy_handler_body(
    entry: &MixinEntry,
    handler: &MethodNode,
    target_class: &ClassNode,
    target_method: &mut MethodNode,
    returns: ReturnHandling,
) -> Result<AdaptedBody> {
    if !handler.has_code() {
        bail!("handler {} has no body to copy", handler.key());
    }
    let (mut insns, label_map) = clone_with_fresh_labels(&handler.insns, target_method);
    // Stale frames from the mixin classfile never survive the copy.
    insns.retain(|insn| !matches!(insn, Insn::Frame(_)));
    let try_catch = handler
        .try_catch
        .iter()
        .map(|range| {
            let fresh = |label| {
                label_map
                    .get(&label)
                    .copied()
                    .with_context(|| format!("try/catch label {label} missing from handler body"))
            };
            Ok(TryCatch {
                start: fresh(range.start)?,
                end: fresh(range.end)?,
                handler: fresh(range.handler)?,
                catch_type: range.catch_type.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    remap_locals(&mut insns, handler, target_method)?;
    rebind_owners(&mut insns, entry, target_class);
    if entry.singleton && target_method.is_static() && !handler.is_static() {
        promote_singleton_calls(&mut insns, &entry.class.name)?;
    }
    adapt_returns(&mut insns, handler, returns);

    Ok(AdaptedBody { insns, try_catch })
}

/// Remap local indices from the handler frame onto the target frame.
fn remap_locals(
    insns: &mut Vec<Insn>,
    handler: &MethodNode,
    target_method: &MethodNode,
) -> Result<()> {
    let source_receiver = if handler.is_static() { 0u16 } else { 1 };
    let target_receiver = if target_method.is_static() { 0u16 } else { 1 };
    let source_params = parameter_slots(&handler.descriptor)? + source_receiver;
    let target_params = parameter_slots(&target_method.descriptor)? + target_receiver;

    // Pair source parameter slots with target parameter slots positionally.
    let mut index_map: HashMap<u16, u16> = HashMap::new();
    let source_descriptors = parameter_descriptors(&handler.descriptor)?;
    let target_descriptors = parameter_descriptors(&target_method.descriptor)?;
    let mut source_slot = source_receiver;
    let mut target_slot = target_receiver;
    for (position, descriptor) in source_descriptors.iter().enumerate() {
        let Some(target_descriptor) = target_descriptors.get(position) else {
            break;
        };
        index_map.insert(source_slot, target_slot);
        source_slot += slot_width(descriptor);
        target_slot += slot_width(target_descriptor);
    }

    let shift = target_params as i32 - source_params as i32;
    let mut remapped = Vec::with_capacity(insns.len());
    for insn in insns.drain(..) {
        let var = match &insn {
            Insn::Var { var, .. } => Some(*var),
            Insn::Iinc { var, .. } => Some(*var),
            _ => None,
        };
        let Some(var) = var else {
            remapped.push(insn);
            continue;
        };
        if !handler.is_static() && var == 0 {
            // The source receiver has no meaning inside the target frame.
            continue;
        }
        let new_var = if var < source_params {
            match index_map.get(&var) {
                Some(mapped) => *mapped,
                None => bail!(
                    "handler {} parameter slot {var} has no target counterpart",
                    handler.key()
                ),
            }
        } else {
            let shifted = var as i32 + shift;
            if !(0..=u16::MAX as i32).contains(&shifted) {
                bail!("local index {shifted} escapes the classfile range");
            }
            shifted as u16
        };
        remapped.push(match insn {
            Insn::Var { opcode, .. } => Insn::Var { opcode, var: new_var },
            Insn::Iinc { delta, .. } => Insn::Iinc { var: new_var, delta },
            other => other,
        });
    }
    *insns = remapped;
    Ok(())
}

/// Rewrite member references against the mixin class: shadow fields and
/// methods rebind to the target class, copy handlers rebind to their
/// declared target names.
fn rebind_owners(insns: &mut [Insn], entry: &MixinEntry, target_class: &ClassNode) {
    let mixin_name = entry.class.name.clone();
    for insn in insns.iter_mut() {
        match insn {
            Insn::Field { opcode, owner, name, .. } if *owner == mixin_name => {
                let declared = entry
                    .class
                    .field(name)
                    .map(|field| {
                        field.annotations.iter().any(|annotation| {
                            annotation.descriptor == crate::directive::api_descriptor("Shadow")
                        })
                    })
                    .unwrap_or(false);
                if !declared {
                    continue;
                }
                let target_name = shadow_target_name(name).to_string();
                let target_static = target_class
                    .field(&target_name)
                    .map(|field| field.is_static())
                    .unwrap_or(*opcode == opcodes::GETSTATIC || *opcode == opcodes::PUTSTATIC);
                *owner = target_class.name.clone();
                *name = target_name;
                *opcode = match (*opcode, target_static) {
                    (opcodes::GETFIELD | opcodes::GETSTATIC, true) => opcodes::GETSTATIC,
                    (opcodes::GETFIELD | opcodes::GETSTATIC, false) => opcodes::GETFIELD,
                    (_, true) => opcodes::PUTSTATIC,
                    (_, false) => opcodes::PUTFIELD,
                };
            }
            Insn::Method { owner, name, descriptor, .. } if *owner == mixin_name => {
                if let Some((_, target_name)) = entry
                    .shadow_methods
                    .iter()
                    .find(|(handler, _)| handler.name == *name)
                {
                    *owner = target_class.name.clone();
                    *name = target_name.clone();
                } else if let Some((_, target_name)) = entry
                    .copies
                    .iter()
                    .find(|(handler, _)| handler.name == *name && handler.descriptor == *descriptor)
                {
                    *owner = target_class.name.clone();
                    *name = target_name.clone();
                }
            }
            _ => {}
        }
    }
}

/// Excise `getstatic INSTANCE` receivers and promote the matching mixin
/// invocation to `invokestatic`. Identification forward-scans an abstract
/// stack-depth counter, bounded to [`PROMOTION_LOOKAHEAD`] instructions.
fn promote_singleton_calls(insns: &mut Vec<Insn>, mixin_name: &str) -> Result<()> {
    let mut removals = Vec::new();
    let mut promotions = Vec::new();
    for (index, insn) in insns.iter().enumerate() {
        let is_instance_load = matches!(
            insn,
            Insn::Field { opcode: opcodes::GETSTATIC, owner, name, .. }
                if owner == mixin_name && name == "INSTANCE"
        );
        if !is_instance_load || removals.contains(&index) {
            continue;
        }
        let mut depth: i32 = 1;
        for (ahead, candidate) in insns.iter().enumerate().skip(index + 1) {
            if ahead - index > PROMOTION_LOOKAHEAD {
                break;
            }
            if let Insn::Method { opcode, owner, descriptor, .. } = candidate {
                let virtual_call =
                    *opcode == opcodes::INVOKEVIRTUAL || *opcode == opcodes::INVOKESPECIAL;
                if virtual_call && owner == mixin_name {
                    let args = parameter_slots(descriptor)? as i32;
                    if depth == args + 1 {
                        removals.push(index);
                        promotions.push(ahead);
                        break;
                    }
                }
            }
            // Control flow would invalidate the depth model.
            if matches!(
                candidate,
                Insn::Jump { .. } | Insn::TableSwitch { .. } | Insn::LookupSwitch { .. }
            ) || candidate.is_return()
            {
                break;
            }
            depth += insn_stack_delta(candidate)?;
            if depth <= 0 {
                break;
            }
        }
    }
    for index in &promotions {
        if let Insn::Method { opcode, .. } = &mut insns[*index] {
            *opcode = opcodes::INVOKESTATIC;
        }
    }
    removals.sort_unstable();
    for index in removals.into_iter().rev() {
        insns.remove(index);
    }
    Ok(())
}

/// Rewrite RETURN instructions per the requested handling.
fn adapt_returns(insns: &mut Vec<Insn>, handler: &MethodNode, returns: ReturnHandling) {
    match returns {
        ReturnHandling::JumpTo(label) => {
            for insn in insns.iter_mut() {
                if insn.is_return() {
                    *insn = Insn::Jump { opcode: opcodes::GOTO, label };
                }
            }
        }
        ReturnHandling::Adapt(target_return) => {
            let source_return = return_descriptor(&handler.descriptor).to_string();
            if source_return == target_return {
                return;
            }
            let mut adapted = Vec::with_capacity(insns.len() + 4);
            for insn in insns.drain(..) {
                if !insn.is_return() {
                    adapted.push(insn);
                    continue;
                }
                match slot_width(&source_return) {
                    _ if source_return == "V" => {}
                    2 => adapted.push(Insn::Simple(opcodes::POP2)),
                    _ => adapted.push(Insn::Simple(opcodes::POP)),
                }
                adapted.extend(default_value(target_return));
                adapted.push(make_return(target_return));
            }
            *insns = adapted;
        }
    }
}
