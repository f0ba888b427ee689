//! The injection-point family: HEAD, TAIL, RETURN, and INVOKE injects.

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::bytecode::{box_value, default_value, load_param, make_return, store_opcode, unbox_value};
use crate::descriptor::{parameter_descriptors, return_descriptor, slot_width};
use crate::directive::{At, HandlerRef, Shift, Slice};
use crate::injectors::{
    handler_call, invoke_matches, new_callback_info, save_call_values, slice_window,
    wants_callback_info,
};
use crate::inline::{copy_handler_body, ReturnHandling};
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::runtime;
use crate::tree::{ClassNode, Insn, MethodNode};

/// Options shared by the HEAD/TAIL/RETURN injectors.
pub struct InjectOptions {
    pub cancellable: bool,
    pub inline: bool,
}

fn validate_plain_handler(handler: &HandlerRef) -> Result<bool> {
    let wants_ci = wants_callback_info(handler)?;
    let parameters = parameter_descriptors(&handler.descriptor)?;
    let expected = if wants_ci { 1 } else { 0 };
    if parameters.len() != expected {
        bail!(
            "inject handler {} must take no parameters besides an optional CallbackInfo",
            handler.name
        );
    }
    Ok(wants_ci)
}

fn validate_inline_handler(entry: &MixinEntry, handler: &HandlerRef) -> Result<()> {
    if wants_callback_info(handler)? {
        bail!("inline inject handler {} cannot take a CallbackInfo", handler.name);
    }
    if return_descriptor(&handler.descriptor) != "V" {
        bail!("inline inject handler {} must return void", handler.name);
    }
    if !handler.is_static && !entry.singleton {
        bail!("inline inject handler {} must be static or live on a singleton mixin", handler.name);
    }
    Ok(())
}

/// The invoke-the-handler block shared by HEAD and TAIL: optional
/// CallbackInfo allocation, dispatch prefix, the call, and result cleanup.
fn handler_block(
    entry: &MixinEntry,
    class_name: &str,
    method: &mut MethodNode,
    handler: &HandlerRef,
) -> Result<(Option<u16>, Vec<Insn>)> {
    let wants_ci = validate_plain_handler(handler)?;
    let mut block = Vec::new();
    let ci_local = if wants_ci {
        let (local, setup) = new_callback_info(method);
        block.extend(setup);
        Some(local)
    } else {
        None
    };
    let call = handler_call(entry, handler, class_name, method);
    block.extend(call.prefix);
    if let Some(local) = ci_local {
        block.push(Insn::Var { opcode: opcodes::ALOAD, var: local });
    }
    block.push(call.invoke);
    block.extend(call.discard_result);
    Ok((ci_local, block))
}

/// HEAD inject: the handler runs before any original instruction; a
/// cancellable handler can short-circuit the method through a guarded
/// early return. Runs last in the driver, so the guard's RETURN is never
/// seen by RETURN or TAIL processing.
pub fn inject_head(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
    options: &InjectOptions,
) -> Result<()> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let return_type = return_descriptor(&method.descriptor).to_string();

    let block = if options.inline {
        validate_inline_handler(entry, handler)?;
        inline_block(entry, class, handler, &mut method)?
    } else {
        let (ci_local, mut block) = handler_block(entry, &class_name, &mut method, handler)?;
        if options.cancellable {
            if let Some(ci) = ci_local {
                block.extend(cancellation_guard(&mut method, ci, &return_type));
            } else {
                warn!(
                    handler = %handler.name,
                    "cancellable HEAD inject without a CallbackInfo parameter cannot cancel"
                );
            }
        }
        block
    };

    let was_empty = method.insns.is_empty();
    let mut insns = block;
    insns.extend(method.insns.drain(..));
    if was_empty {
        insns.extend(default_value(&return_type));
        insns.push(make_return(&return_type));
    }
    method.insns = insns;
    method.access &= !(opcodes::ACC_ABSTRACT | opcodes::ACC_NATIVE);
    class.methods[method_index] = method;
    Ok(())
}

/// The guarded early return emitted for a cancellable HEAD inject.
fn cancellation_guard(method: &mut MethodNode, ci_local: u16, return_type: &str) -> Vec<Insn> {
    let resume = method.new_label();
    let mut guard = vec![
        Insn::Var { opcode: opcodes::ALOAD, var: ci_local },
        Insn::Method {
            opcode: opcodes::INVOKEVIRTUAL,
            owner: runtime::CALLBACK_INFO.to_string(),
            name: "isCancelled".to_string(),
            descriptor: "()Z".to_string(),
            interface: false,
        },
        Insn::Jump { opcode: opcodes::IFEQ, label: resume },
    ];
    if return_type == "V" {
        guard.push(Insn::Simple(opcodes::RETURN));
    } else {
        let use_default = method.new_label();
        guard.push(Insn::Var { opcode: opcodes::ALOAD, var: ci_local });
        guard.push(Insn::Method {
            opcode: opcodes::INVOKEVIRTUAL,
            owner: runtime::CALLBACK_INFO.to_string(),
            name: "getReturnValue".to_string(),
            descriptor: "()Ljava/lang/Object;".to_string(),
            interface: false,
        });
        guard.push(Insn::Simple(opcodes::DUP));
        guard.push(Insn::Jump { opcode: opcodes::IFNULL, label: use_default });
        guard.extend(unbox_value(return_type));
        guard.push(make_return(return_type));
        guard.push(Insn::Label(use_default));
        guard.push(Insn::Simple(opcodes::POP));
        guard.extend(default_value(return_type));
        guard.push(make_return(return_type));
    }
    guard.push(Insn::Label(resume));
    guard
}

fn inline_block(
    entry: &MixinEntry,
    class: &ClassNode,
    handler: &HandlerRef,
    method: &mut MethodNode,
) -> Result<Vec<Insn>> {
    let source = entry
        .class
        .method(&handler.name, Some(&handler.descriptor))
        .with_context(|| format!("inline handler {} missing from mixin", handler.name))?
        .clone();
    let after = method.new_label();
    let body = copy_handler_body(entry, &source, class, method, ReturnHandling::JumpTo(after))?;
    method.try_catch.extend(body.try_catch);
    let mut block = body.insns;
    block.push(Insn::Label(after));
    Ok(block)
}

/// TAIL inject: the handler call is cloned before each original RETURN;
/// a method with no RETURN gets a single copy before its last instruction.
pub fn inject_tail(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
    options: &InjectOptions,
) -> Result<()> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let return_type = return_descriptor(&method.descriptor).to_string();

    let block = if options.inline {
        validate_inline_handler(entry, handler)?;
        inline_block(entry, class, handler, &mut method)?
    } else {
        handler_block(entry, &class_name, &mut method, handler)?.1
    };

    let return_indices = method.return_indices();
    if return_indices.is_empty() {
        if method.insns.is_empty() {
            method.insns = block;
            method.insns.extend(default_value(&return_type));
            method.insns.push(make_return(&return_type));
            method.access &= !(opcodes::ACC_ABSTRACT | opcodes::ACC_NATIVE);
        } else {
            let at = method.insns.len() - 1;
            let (clone, _) = crate::tree::clone_with_fresh_labels(&block, &mut method);
            method.insns.splice(at..at, clone);
        }
    } else {
        for index in return_indices.into_iter().rev() {
            let (clone, _) = crate::tree::clone_with_fresh_labels(&block, &mut method);
            method.insns.splice(index..index, clone);
        }
    }
    class.methods[method_index] = method;
    Ok(())
}

/// RETURN inject: before each original RETURN the value is saved, the
/// handler runs, and a non-null CallbackInfo override replaces the saved
/// value before it is reloaded for the RETURN.
pub fn inject_return(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
) -> Result<()> {
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();
    let return_type = return_descriptor(&method.descriptor).to_string();
    let wants_ci = validate_plain_handler(handler)?;
    let is_void = return_type == "V";

    for index in method.return_indices().into_iter().rev() {
        let mut site = Vec::new();
        let saved = if is_void {
            None
        } else {
            let local = method.new_local(slot_width(&return_type));
            site.push(Insn::Var { opcode: store_opcode(&return_type), var: local });
            Some(local)
        };
        let ci_local = if wants_ci {
            let (local, setup) = new_callback_info(&mut method);
            site.extend(setup);
            if let Some(saved) = saved {
                site.push(Insn::Var { opcode: opcodes::ALOAD, var: local });
                site.push(load_param(&return_type, saved));
                site.extend(box_value(&return_type));
                site.push(Insn::Method {
                    opcode: opcodes::INVOKEVIRTUAL,
                    owner: runtime::CALLBACK_INFO.to_string(),
                    name: "setReturnValue".to_string(),
                    descriptor: "(Ljava/lang/Object;)V".to_string(),
                    interface: false,
                });
            }
            Some(local)
        } else {
            None
        };
        let call = handler_call(entry, handler, &class_name, &mut method);
        site.extend(call.prefix);
        if let Some(ci) = ci_local {
            site.push(Insn::Var { opcode: opcodes::ALOAD, var: ci });
        }
        site.push(call.invoke);
        site.extend(call.discard_result);
        if let (Some(ci), Some(saved)) = (ci_local, saved) {
            let keep = method.new_label();
            let done = method.new_label();
            site.push(Insn::Var { opcode: opcodes::ALOAD, var: ci });
            site.push(Insn::Method {
                opcode: opcodes::INVOKEVIRTUAL,
                owner: runtime::CALLBACK_INFO.to_string(),
                name: "getReturnValue".to_string(),
                descriptor: "()Ljava/lang/Object;".to_string(),
                interface: false,
            });
            site.push(Insn::Simple(opcodes::DUP));
            site.push(Insn::Jump { opcode: opcodes::IFNULL, label: keep });
            site.extend(unbox_value(&return_type));
            site.push(Insn::Var { opcode: store_opcode(&return_type), var: saved });
            site.push(Insn::Jump { opcode: opcodes::GOTO, label: done });
            site.push(Insn::Label(keep));
            site.push(Insn::Simple(opcodes::POP));
            site.push(Insn::Label(done));
        }
        if let Some(saved) = saved {
            site.push(load_param(&return_type, saved));
        }
        method.insns.splice(index..index, site);
    }
    class.methods[method_index] = method;
    Ok(())
}

/// INVOKE inject: runs the handler around (or instead of) matching call
/// sites. Returns the number of matched sites.
#[allow(clippy::too_many_arguments)]
pub fn inject_invoke(
    entry: &MixinEntry,
    class: &mut ClassNode,
    method_index: usize,
    handler: &HandlerRef,
    at: &At,
    ordinal: i32,
    require: i32,
    expect: i32,
    slice: &Slice,
) -> Result<usize> {
    if wants_callback_info(handler)? {
        bail!("INVOKE inject handler {} cannot take a CallbackInfo", handler.name);
    }
    let mut method = class.methods[method_index].clone();
    let class_name = class.name.clone();

    let (window_start, window_end) = slice_window(&method.insns, slice);
    let mut matches: Vec<usize> = method.insns[window_start..window_end]
        .iter()
        .enumerate()
        .filter(|(_, insn)| invoke_matches(insn, &at.target))
        .map(|(index, _)| window_start + index)
        .collect();
    let matched = matches.len();
    if ordinal >= 0 {
        matches = matches.into_iter().nth(ordinal as usize).into_iter().collect();
    }

    let handler_params = parameter_descriptors(&handler.descriptor)?.len();
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
        match at.shift {
            Shift::Before => {
                let saved = save_call_values(&mut method, receiver, &call_params);
                let call = handler_call(entry, handler, &class_name, &mut method);
                let mut site = saved.stores.clone();
                site.extend(call.prefix);
                site.extend(saved.load_prefix(handler_params)?);
                site.push(call.invoke);
                site.extend(call.discard_result);
                site.extend(saved.loads.clone());
                method.insns.splice(index..index, site);
            }
            Shift::After => {
                if handler_params > usize::from(call_return != "V") {
                    bail!(
                        "AFTER inject handler {} may only take the call result",
                        handler.name
                    );
                }
                let mut site = Vec::new();
                let result = if call_return != "V" {
                    let local = method.new_local(slot_width(&call_return));
                    site.push(Insn::Var { opcode: store_opcode(&call_return), var: local });
                    Some(local)
                } else {
                    None
                };
                let call = handler_call(entry, handler, &class_name, &mut method);
                site.extend(call.prefix);
                if handler_params == 1 {
                    if let Some(result) = result {
                        site.push(load_param(&call_return, result));
                    }
                }
                site.push(call.invoke);
                site.extend(call.discard_result);
                if let Some(result) = result {
                    site.push(load_param(&call_return, result));
                }
                method.insns.splice(index + 1..index + 1, site);
            }
            Shift::Replace => {
                let saved = save_call_values(&mut method, receiver, &call_params);
                let call = handler_call(entry, handler, &class_name, &mut method);
                let mut site = saved.stores.clone();
                site.extend(call.prefix);
                site.extend(saved.load_prefix(handler_params)?);
                site.push(call.invoke);
                let handler_return = return_descriptor(&handler.descriptor);
                site.extend(super::coerce_return(handler_return, &call_return)?);
                method.insns.splice(index..index + 1, site);
            }
        }
    }

    if require >= 0 && matched < require as usize {
        bail!(
            "INVOKE inject {} matched {matched} call sites, {require} required",
            handler.name
        );
    }
    if expect >= 0 && matched < expect as usize {
        warn!(
            handler = %handler.name,
            matched, expect, "INVOKE inject matched fewer call sites than expected"
        );
    }
    class.methods[method_index] = method;
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{
        ACC_PUBLIC, ACC_STATIC, ALOAD, ARETURN, GETSTATIC, INVOKESTATIC, INVOKEVIRTUAL, RETURN,
    };
    use crate::test_harness::{registered_mixin, simple_mixin_class, target_with_method};

    fn handler(name: &str, descriptor: &str) -> HandlerRef {
        HandlerRef { name: name.to_string(), descriptor: descriptor.to_string(), is_static: true }
    }

    fn plain_options() -> InjectOptions {
        InjectOptions { cancellable: false, inline: false }
    }

    #[test]
    fn head_inject_prepends_the_handler_call() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "go",
            "()V",
            vec![Insn::Simple(RETURN)],
        );
        inject_head(&entry, &mut class, 0, &handler("onHead", "()V"), &plain_options()).unwrap();
        let insns = &class.methods[0].insns;
        assert!(matches!(
            &insns[0],
            Insn::Method { opcode: INVOKESTATIC, owner, name, .. }
                if owner == "m/M" && name == "onHead"
        ));
        assert!(matches!(insns[1], Insn::Simple(RETURN)));
    }

    #[test]
    fn cancellable_head_inject_guards_with_callback_info() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "name",
            "()Ljava/lang/String;",
            vec![Insn::Simple(opcodes::ACONST_NULL), Insn::Simple(ARETURN)],
        );
        inject_head(
            &entry,
            &mut class,
            0,
            &handler("onHead", "(Lclassweave/runtime/CallbackInfo;)V"),
            &InjectOptions { cancellable: true, inline: false },
        )
        .unwrap();
        let insns = &class.methods[0].insns;
        // CallbackInfo allocation leads, and the guard emits two
        // early-return paths before the original body.
        assert!(matches!(&insns[0], Insn::Type { opcode: opcodes::NEW, class_name }
            if class_name == runtime::CALLBACK_INFO));
        let returns = insns.iter().filter(|insn| insn.is_return()).count();
        assert_eq!(returns, 3);
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { name, .. } if name == "isCancelled"
        )));
        // The original body is still the tail.
        assert!(matches!(insns[insns.len() - 2], Insn::Simple(opcodes::ACONST_NULL)));
    }

    #[test]
    fn tail_inject_clones_before_every_return() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "go",
            "()V",
            vec![
                Insn::Simple(RETURN),
                Insn::Simple(opcodes::NOP),
                Insn::Simple(RETURN),
            ],
        );
        inject_tail(&entry, &mut class, 0, &handler("onTail", "()V"), &plain_options()).unwrap();
        let insns = &class.methods[0].insns;
        let calls = insns
            .iter()
            .filter(|insn| matches!(insn, Insn::Method { name, .. } if name == "onTail"))
            .count();
        assert_eq!(calls, 2);
        assert!(matches!(insns[0], Insn::Method { .. }));
    }

    #[test]
    fn tail_inject_twice_runs_the_handler_twice() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        inject_tail(&entry, &mut class, 0, &handler("onTail", "()V"), &plain_options()).unwrap();
        inject_tail(&entry, &mut class, 0, &handler("onTail", "()V"), &plain_options()).unwrap();
        let insns = &class.methods[0].insns;
        let calls: Vec<usize> = insns
            .iter()
            .enumerate()
            .filter(|(_, insn)| matches!(insn, Insn::Method { name, .. } if name == "onTail"))
            .map(|(index, _)| index)
            .collect();
        // Two sequential invocations before the sole RETURN.
        assert_eq!(calls.len(), 2);
        assert!(matches!(insns[insns.len() - 1], Insn::Simple(RETURN)));
        assert!(calls[1] < insns.len() - 1);
    }

    #[test]
    fn tail_inject_appends_when_no_return_exists() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "spin",
            "()V",
            vec![Insn::Simple(opcodes::NOP), Insn::Simple(opcodes::ATHROW)],
        );
        inject_tail(&entry, &mut class, 0, &handler("onTail", "()V"), &plain_options()).unwrap();
        let insns = &class.methods[0].insns;
        assert!(matches!(insns[0], Insn::Simple(opcodes::NOP)));
        assert!(matches!(&insns[1], Insn::Method { name, .. } if name == "onTail"));
        assert!(matches!(insns[2], Insn::Simple(opcodes::ATHROW)));
    }

    #[test]
    fn return_inject_saves_and_reloads_the_value() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "name",
            "()Ljava/lang/String;",
            vec![Insn::Simple(opcodes::ACONST_NULL), Insn::Simple(ARETURN)],
        );
        inject_return(&entry, &mut class, 0, &handler("onReturn", "()V")).unwrap();
        let method = &class.methods[0];
        let insns = &method.insns;
        // store, call, reload, original areturn
        assert!(matches!(insns[1], Insn::Var { opcode: opcodes::ASTORE, .. }));
        assert!(matches!(&insns[2], Insn::Method { name, .. } if name == "onReturn"));
        assert!(matches!(insns[3], Insn::Var { opcode: ALOAD, .. }));
        assert!(matches!(insns[4], Insn::Simple(ARETURN)));
        assert!(method.max_locals >= 2);
    }

    #[test]
    fn return_inject_override_path_unboxes_into_the_saved_local() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "count",
            "()I",
            vec![Insn::Simple(opcodes::ICONST_0), Insn::Simple(opcodes::IRETURN)],
        );
        inject_return(
            &entry,
            &mut class,
            0,
            &handler("onReturn", "(Lclassweave/runtime/CallbackInfo;)V"),
        )
        .unwrap();
        let insns = &class.methods[0].insns;
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { name, .. } if name == "setReturnValue"
        )));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { name, .. } if name == "getReturnValue"
        )));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { name, .. } if name == "intValue"
        )));
    }

    #[test]
    fn invoke_inject_before_saves_and_restores_the_call() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let println = Insn::Method {
            opcode: INVOKEVIRTUAL,
            owner: "java/io/PrintStream".to_string(),
            name: "println".to_string(),
            descriptor: "(Ljava/lang/String;)V".to_string(),
            interface: false,
        };
        let mut class = target_with_method(
            "t/T",
            "log",
            "()V",
            vec![
                Insn::Field {
                    opcode: GETSTATIC,
                    owner: "java/lang/System".to_string(),
                    name: "out".to_string(),
                    descriptor: "Ljava/io/PrintStream;".to_string(),
                },
                Insn::Ldc(crate::tree::Const::String("hi".to_string())),
                println.clone(),
                Insn::Simple(RETURN),
            ],
        );
        let at = At { target: "println".to_string(), shift: Shift::Before };
        let matched = inject_invoke(
            &entry,
            &mut class,
            0,
            &handler("before", "()V"),
            &at,
            -1,
            -1,
            -1,
            &Slice::default(),
        )
        .unwrap();
        assert_eq!(matched, 1);
        let insns = &class.methods[0].insns;
        // The call site survives, preceded by spill/handler/restore.
        assert!(insns.contains(&println));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { name, .. } if name == "before"
        )));
        let call_position =
            insns.iter().position(|insn| *insn == println).unwrap();
        assert!(matches!(insns[call_position - 1], Insn::Var { opcode: ALOAD, .. }));
    }

    #[test]
    fn invoke_inject_require_fails_when_unmatched() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        let at = At { target: "missing".to_string(), shift: Shift::Before };
        let result = inject_invoke(
            &entry,
            &mut class,
            0,
            &handler("before", "()V"),
            &at,
            -1,
            1,
            -1,
            &Slice::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn head_inject_on_empty_body_synthesizes_the_return() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method("t/T", "stub", "()I", Vec::new());
        class.methods[0].access |= opcodes::ACC_ABSTRACT;
        inject_head(&entry, &mut class, 0, &handler("onHead", "()V"), &plain_options()).unwrap();
        let method = &class.methods[0];
        assert!(!method.is_abstract());
        assert!(matches!(method.insns[0], Insn::Method { .. }));
        assert!(matches!(
            &method.insns[method.insns.len() - 2..],
            [Insn::Simple(opcodes::ICONST_0), Insn::Simple(opcodes::IRETURN)]
        ));
    }

    #[test]
    fn inject_handlers_reject_extra_parameters() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        let result = inject_head(
            &entry,
            &mut class,
            0,
            &handler("bad", "(I)V"),
            &plain_options(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn instance_handler_on_plain_mixin_lazily_initialises_the_singleton_field() {
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        let instance_handler = HandlerRef {
            name: "onHead".to_string(),
            descriptor: "()V".to_string(),
            is_static: false,
        };
        inject_head(&entry, &mut class, 0, &instance_handler, &plain_options()).unwrap();
        let insns = &class.methods[0].insns;
        let field = crate::injectors::instance_field_name("M");
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Field { opcode: GETSTATIC, name, .. } if *name == field
        )));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Type { opcode: opcodes::NEW, class_name } if class_name == "m/M"
        )));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method { opcode: INVOKEVIRTUAL, name, .. } if name == "onHead"
        )));
    }

    #[test]
    fn static_target_test_scenario_matches_head_cancel_shape() {
        // HEAD inject on a static method keeps the handler call first even
        // with the cancellation guard in place.
        let entry = registered_mixin(simple_mixin_class("m/M"));
        let mut class = target_with_method(
            "t/T",
            "testB0",
            "()Ljava/lang/String;",
            vec![
                Insn::Field {
                    opcode: GETSTATIC,
                    owner: "t/T".to_string(),
                    name: "staticFinalString".to_string(),
                    descriptor: "Ljava/lang/String;".to_string(),
                },
                Insn::Simple(ARETURN),
            ],
        );
        class.methods[0].access = ACC_PUBLIC | ACC_STATIC;
        inject_head(
            &entry,
            &mut class,
            0,
            &handler("onHead", "(Lclassweave/runtime/CallbackInfo;)V"),
            &InjectOptions { cancellable: true, inline: false },
        )
        .unwrap();
        let insns = &class.methods[0].insns;
        let original_position = insns
            .iter()
            .position(|insn| matches!(insn, Insn::Field { name, .. } if name == "staticFinalString"))
            .unwrap();
        let guard_position = insns
            .iter()
            .position(|insn| matches!(insn, Insn::Method { name, .. } if name == "isCancelled"))
            .unwrap();
        assert!(guard_position < original_position);
    }
}
