//! Per-(target, mixin) driver: applies one mixin's directives to one
//! class tree in the fixed three-pass order that keeps directives from
//! interfering with each other.

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::directive::{shadow_target_name, Directive, InjectionPoint, MethodKey};
use crate::injectors::{self, accessor, inject, modify, overwrite, redirect, replace_all, strip};
use crate::opcodes;
use crate::registry::MixinEntry;
use crate::tree::{ClassNode, FieldNode};

/// Which of the method-directive passes a directive belongs to. RETURN and
/// TAIL run before HEAD so that a cancellable HEAD's early-return guard is
/// never visible to the RETURN/TAIL scanners.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pass {
    Early,
    ReturnTail,
    Head,
}

fn pass_of(directive: &Directive) -> Pass {
    match directive {
        Directive::Inject { point: InjectionPoint::Head, .. } => Pass::Head,
        Directive::Inject { point: InjectionPoint::Tail | InjectionPoint::Return, .. } => {
            Pass::ReturnTail
        }
        _ => Pass::Early,
    }
}

/// Apply every directive of `entry` to `class`. Directive failures are
/// reported through the diagnostic sink and skipped; only the per-class
/// result is returned. Returns whether the class tree changed.
pub fn apply_mixin(class: &mut ClassNode, entry: &MixinEntry) -> Result<bool> {
    let mut changed = false;

    // Pass 1: prepare the target shape for instance-handler dispatch.
    if !entry.singleton && has_instance_handlers(entry) {
        let field_name = injectors::instance_field_name(entry.simple_name());
        if class.field(&field_name).is_none() {
            class.fields.push(FieldNode {
                access: opcodes::ACC_PRIVATE | opcodes::ACC_STATIC | opcodes::ACC_SYNTHETIC,
                name: field_name,
                descriptor: format!("L{};", entry.class.name),
                signature: None,
                constant: None,
                annotations: Vec::new(),
            });
            changed = true;
        }
    }

    // Pass 2: replace-all-methods rewrites every body first; later
    // directives compose on top of the stubs.
    if let Some(directive) = &entry.replace_all {
        let rewritten = replace_all::replace_all_methods(class, directive)
            .context("replace-all-methods")?;
        if !class.is_interface() {
            class.access &= !opcodes::ACC_ABSTRACT;
        }
        changed |= rewritten > 0;
    }

    // Field-level directives come before method directives.
    for directive in &entry.directives {
        if let Err(error) = apply_field_directive(class, directive, &mut changed) {
            warn!(
                mixin = %entry.class.name,
                class = %class.name,
                error = %format!("{error:#}"),
                "field directive failed, skipping"
            );
        }
    }

    // Passes 3-5: everything else, then RETURN/TAIL, then HEAD.
    for pass in [Pass::Early, Pass::ReturnTail, Pass::Head] {
        for directive in &entry.directives {
            if pass_of(directive) != pass || is_field_directive(directive) {
                continue;
            }
            match apply_directive(class, entry, directive) {
                Ok(applied) => changed |= applied,
                Err(error) => warn!(
                    mixin = %entry.class.name,
                    class = %class.name,
                    error = %format!("{error:#}"),
                    "directive failed, skipping"
                ),
            }
        }
    }

    Ok(changed)
}

fn has_instance_handlers(entry: &MixinEntry) -> bool {
    entry.directives.iter().any(|directive| match directive {
        Directive::Inject { handler, .. }
        | Directive::ModifyArg { handler, .. }
        | Directive::ModifyReturnValue { handler, .. }
        | Directive::ModifyConstant { handler, .. }
        | Directive::Redirect { handler, .. } => !handler.is_static,
        _ => false,
    })
}

fn is_field_directive(directive: &Directive) -> bool {
    matches!(
        directive,
        Directive::ShadowField { .. } | Directive::MutableField { .. } | Directive::FinalField { .. }
    )
}

fn apply_field_directive(
    class: &mut ClassNode,
    directive: &Directive,
    changed: &mut bool,
) -> Result<()> {
    match directive {
        // Shadow fields are metadata for the inline generator; the target
        // is untouched.
        Directive::ShadowField { .. } => Ok(()),
        Directive::MutableField { field } => {
            let target_name = shadow_target_name(field);
            let field = find_field(class, target_name)?;
            if field.access & opcodes::ACC_FINAL != 0 {
                field.access &= !opcodes::ACC_FINAL;
                *changed = true;
            }
            Ok(())
        }
        Directive::FinalField { field } => {
            let target_name = shadow_target_name(field);
            let field = find_field(class, target_name)?;
            if field.access & opcodes::ACC_FINAL == 0 {
                field.access |= opcodes::ACC_FINAL;
                *changed = true;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn find_field<'a>(class: &'a mut ClassNode, name: &str) -> Result<&'a mut FieldNode> {
    let class_name = class.name.clone();
    class
        .fields
        .iter_mut()
        .find(|field| field.name == name)
        .with_context(|| format!("field {name} missing on {class_name}"))
}

/// Locate the target method for a directive, with the structured
/// target-missing warning of the error policy.
fn resolve_target(class: &ClassNode, key: &MethodKey) -> Result<usize> {
    match class.method_index(&key.name, key.descriptor.as_deref()) {
        Some(index) => Ok(index),
        None => {
            let mut available = class.method_keys();
            available.sort();
            let hierarchy: Vec<&str> = class
                .super_name
                .iter()
                .map(String::as_str)
                .chain(class.interfaces.iter().map(String::as_str))
                .collect();
            bail!(
                "no method {key} on {}; available: [{}]; the member may live in {:?}",
                class.name,
                available.join(", "),
                hierarchy
            )
        }
    }
}

fn apply_directive(class: &mut ClassNode, entry: &MixinEntry, directive: &Directive) -> Result<bool> {
    match directive {
        Directive::Inject {
            handler,
            method,
            point,
            at,
            cancellable,
            inline,
            ordinal,
            require,
            expect,
            slice,
        } => {
            let index = resolve_target(class, method)?;
            let options = inject::InjectOptions { cancellable: *cancellable, inline: *inline };
            match point {
                InjectionPoint::Head => {
                    inject::inject_head(entry, class, index, handler, &options)?
                }
                InjectionPoint::Tail => {
                    inject::inject_tail(entry, class, index, handler, &options)?
                }
                InjectionPoint::Return => inject::inject_return(entry, class, index, handler)?,
                InjectionPoint::Invoke => {
                    let at = at.as_ref().context("INVOKE inject without an anchor")?;
                    inject::inject_invoke(
                        entry, class, index, handler, at, *ordinal, *require, *expect, slice,
                    )?;
                }
            }
            Ok(true)
        }
        Directive::Overwrite { handler, method } => {
            let index = resolve_target(class, method)?;
            overwrite::overwrite(entry, class, index, handler)?;
            Ok(true)
        }
        Directive::ModifyArg { handler, method, index } => {
            let target = resolve_target(class, method)?;
            modify::modify_arg(entry, class, target, handler, *index)?;
            Ok(true)
        }
        Directive::ModifyReturnValue { handler, method } => {
            let target = resolve_target(class, method)?;
            modify::modify_return_value(entry, class, target, handler)?;
            Ok(true)
        }
        Directive::ModifyConstant { handler, method, constant } => {
            let target = resolve_target(class, method)?;
            let matched = modify::modify_constant(entry, class, target, handler, constant)?;
            Ok(matched > 0)
        }
        Directive::Redirect { handler, method, target, slice } => {
            let index = resolve_target(class, method)?;
            let matched = redirect::redirect(entry, class, index, handler, target, slice)?;
            Ok(matched > 0)
        }
        Directive::Accessor { handler, field, mutable } => {
            accessor::generate_accessor(class, handler, field, *mutable)?;
            Ok(true)
        }
        Directive::Invoker { handler, method } => {
            accessor::generate_invoker(class, handler, method)?;
            Ok(true)
        }
        Directive::Copy { handler, method } => overwrite::copy(entry, class, handler, method),
        Directive::RemoveMethod { method } => {
            strip::remove_method(class, method)?;
            Ok(true)
        }
        Directive::RemoveSynchronized { method } => {
            strip::remove_synchronized(class, method)?;
            Ok(true)
        }
        Directive::ShadowField { .. }
        | Directive::MutableField { .. }
        | Directive::FinalField { .. } => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::HandlerRef;
    use crate::opcodes::{ACC_FINAL, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ARETURN, RETURN};
    use crate::test_harness::{
        mixin_entry_with, registered_mixin, simple_mixin_class, target_with_method,
    };
    use crate::tree::{Const, Insn};

    fn handler(name: &str, descriptor: &str) -> HandlerRef {
        HandlerRef { name: name.to_string(), descriptor: descriptor.to_string(), is_static: true }
    }

    fn key(name: &str) -> MethodKey {
        MethodKey { name: name.to_string(), descriptor: None }
    }

    #[test]
    fn head_cancellation_returns_are_invisible_to_return_injects() {
        // A RETURN inject and a cancellable HEAD inject on the same
        // method: the HEAD guard's return instructions must not receive
        // the RETURN-inject treatment.
        let entry = mixin_entry_with(
            simple_mixin_class("m/M"),
            vec![
                Directive::Inject {
                    handler: handler("onHead", "(Lclassweave/runtime/CallbackInfo;)V"),
                    method: key("name"),
                    point: InjectionPoint::Head,
                    at: None,
                    cancellable: true,
                    inline: false,
                    ordinal: -1,
                    require: -1,
                    expect: -1,
                    slice: Default::default(),
                },
                Directive::Inject {
                    handler: handler("onReturn", "()V"),
                    method: key("name"),
                    point: InjectionPoint::Return,
                    at: None,
                    cancellable: false,
                    inline: false,
                    ordinal: -1,
                    require: -1,
                    expect: -1,
                    slice: Default::default(),
                },
            ],
        );
        let mut class = target_with_method(
            "t/T",
            "name",
            "()Ljava/lang/String;",
            vec![
                Insn::Ldc(Const::String("value".to_string())),
                Insn::Simple(ARETURN),
            ],
        );
        assert!(apply_mixin(&mut class, &entry).unwrap());

        let insns = &class.methods[0].insns;
        // Exactly one onReturn call: the original return only, not the
        // two guard returns added afterwards by the HEAD pass.
        let return_handler_calls = insns
            .iter()
            .filter(|insn| matches!(insn, Insn::Method { name, .. } if name == "onReturn"))
            .count();
        assert_eq!(return_handler_calls, 1);
        let total_returns = insns.iter().filter(|insn| insn.is_return()).count();
        assert_eq!(total_returns, 3);
    }

    #[test]
    fn failed_directives_do_not_abort_the_remainder() {
        let entry = mixin_entry_with(
            simple_mixin_class("m/M"),
            vec![
                Directive::RemoveMethod { method: key("doesNotExist") },
                Directive::Inject {
                    handler: handler("onHead", "()V"),
                    method: key("go"),
                    point: InjectionPoint::Head,
                    at: None,
                    cancellable: false,
                    inline: false,
                    ordinal: -1,
                    require: -1,
                    expect: -1,
                    slice: Default::default(),
                },
            ],
        );
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        assert!(apply_mixin(&mut class, &entry).unwrap());
        assert!(class.methods[0]
            .insns
            .iter()
            .any(|insn| matches!(insn, Insn::Method { name, .. } if name == "onHead")));
    }

    #[test]
    fn instance_dispatch_synthesizes_the_singleton_field() {
        let entry = mixin_entry_with(
            simple_mixin_class("m/Mixin"),
            vec![Directive::Inject {
                handler: HandlerRef {
                    name: "onHead".to_string(),
                    descriptor: "()V".to_string(),
                    is_static: false,
                },
                method: key("go"),
                point: InjectionPoint::Head,
                at: None,
                cancellable: false,
                inline: false,
                ordinal: -1,
                require: -1,
                expect: -1,
                slice: Default::default(),
            }],
        );
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        apply_mixin(&mut class, &entry).unwrap();
        let field = class.field("$asmInstance$Mixin").unwrap();
        assert!(field.is_static());
        assert_eq!(field.descriptor, "Lm/Mixin;");
        assert!(field.access & opcodes::ACC_SYNTHETIC != 0);
    }

    #[test]
    fn static_handlers_do_not_synthesize_the_singleton_field() {
        let entry = registered_mixin(simple_mixin_class("m/Mixin"));
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        apply_mixin(&mut class, &entry).unwrap();
        assert!(class.field("$asmInstance$Mixin").is_none());
    }

    #[test]
    fn mutable_and_final_field_directives_toggle_flags() {
        let entry = mixin_entry_with(
            simple_mixin_class("m/M"),
            vec![
                Directive::MutableField { field: "shadow_staticFinalString".to_string() },
                Directive::FinalField { field: "plain".to_string() },
            ],
        );
        let mut class = target_with_method("t/T", "go", "()V", vec![Insn::Simple(RETURN)]);
        class.fields.push(crate::tree::FieldNode {
            access: ACC_PRIVATE | ACC_STATIC | ACC_FINAL,
            name: "staticFinalString".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
            signature: None,
            constant: None,
            annotations: Vec::new(),
        });
        class.fields.push(crate::tree::FieldNode {
            access: ACC_PUBLIC,
            name: "plain".to_string(),
            descriptor: "I".to_string(),
            signature: None,
            constant: None,
            annotations: Vec::new(),
        });
        assert!(apply_mixin(&mut class, &entry).unwrap());
        assert!(!class.field("staticFinalString").unwrap().is_final());
        assert!(class.field("plain").unwrap().is_final());
    }
}
