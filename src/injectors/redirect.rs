//! Redirect: replace matching call sites with a handler invocation.

use anyhow::{Result, bail};
use tracing::debug;

use crate::descriptor::{parameter_descriptors, return_descriptor};
use crate::directive::{At, HandlerRef, Slice};
use crate::injectors::{coerce_return, handler_call, invoke_matches, save_call_values, slice_window};
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::tree::{ClassNode, Insn};

/// Replace every `invoke*` matching the target reference: the original
/// operands are spilled into locals, the handler is invoked with them, and
/// its result is coerced to what the original call produced. After this
/// runs, no matching invocation remains in the method. Returns the number
/// of redirected call sites.
pub fn redirect(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
    target: &At,
    slice: &Slice,
) -> Result<usize> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let handler_params = parameter_descriptors(&handler.descriptor)?.len();
    let handler_return = return_descriptor(&handler.descriptor).to_string();

    let (window_start, window_end) = slice_window(&method.insns, slice);
    let matches: Vec<usize> = method.insns[window_start..window_end]
        .iter()
        .enumerate()
        .filter(|(_, insn)| invoke_matches(insn, &target.target))
        .map(|(index, _)| window_start + index)
        .collect();
    let matched = matches.len();
    if matched == 0 {
        debug!(
            handler = %handler.name,
            method = %method.key(),
            target = %target.target,
            "redirect matched no call sites"
        );
    }

    for index in matches.into_iter().rev() {
        let Insn::Method { opcode, owner, descriptor, .. } = method.insns[index].clone() else {
            continue;
        };
        let call_params = parameter_descriptors(&descriptor)?;
        let call_return = return_descriptor(&descriptor).to_string();
        let receiver = if opcode == opcodes::INVOKESTATIC {
            None
        } else {
            Some(format!("L{owner};"))
        };
        if handler_params > call_params.len() + usize::from(receiver.is_some()) {
            bail!(
                "redirect handler {} declares more parameters than the call site carries",
                handler.name
            );
        }
        let saved = save_call_values(&mut method, receiver, &call_params);
        let call = handler_call(entry, handler, &class_name, &mut method);
        let mut site = saved.stores.clone();
        site.extend(call.prefix);
        site.extend(saved.load_prefix(handler_params)?);
        site.push(call.invoke);
        site.extend(coerce_return(&handler_return, &call_return)?);
        method.insns.splice(index..index + 1, site);
    }
    class.methods[method_index] = method;
    Ok(matched)
}
