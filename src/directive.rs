//! Directive model: the edits a mixin declares through its annotations.
//!
//! Annotations live in the `classweave/api` package of the annotations jar
//! shipped alongside the weaver. Each directive is a tagged variant carrying
//! the target-method key plus kind-specific parameters; dispatch over the
//! variants is a plain match in the injector layer.

use anyhow::{Context, Result, bail};

use crate::bytecode::method_descriptor_parse;
use crate::tree::{Annotation, AnnotationValue, ClassNode, FieldNode, MethodNode};

/// Binary package that the directive annotations live in.
pub const API_PACKAGE: &str = "classweave/api";

/// Field descriptor of an annotation in the api package.
pub fn api_descriptor(simple_name: &str) -> String {
    format!("L{API_PACKAGE}/{simple_name};")
}

/// Key identifying a method on the target class. Matching is exact on the
/// descriptor when one is given; otherwise the name alone decides.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodKey {
    pub name: String,
    pub descriptor: Option<String>,
}

impl MethodKey {
    pub fn matches(&self, method: &MethodNode) -> bool {
        method.name == self.name
            && self
                .descriptor
                .as_deref()
                .map_or(true, |descriptor| method.descriptor == descriptor)
    }
}

impl std::fmt::Display for MethodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.descriptor {
            Some(descriptor) => write!(f, "{}{descriptor}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The mixin member that carries a directive.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerRef {
    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
}

/// Injection points supported by `AsmInject`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InjectionPoint {
    Head,
    Tail,
    Return,
    Invoke,
}

/// Position relative to a matched call site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shift {
    Before,
    After,
    Replace,
}

/// An `At` anchor: a call-site pattern plus a shift.
#[derive(Clone, Debug, PartialEq)]
pub struct At {
    /// `owner.name(descriptor)` reference; parts may be empty.
    pub target: String,
    pub shift: Shift,
}

/// A `Slice` window bounded by call-site anchors.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Slice {
    pub from: Option<At>,
    pub to: Option<At>,
}

/// One declarative edit parsed from mixin metadata.
#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    Inject {
        handler: HandlerRef,
        method: MethodKey,
        point: InjectionPoint,
        at: Option<At>,
        cancellable: bool,
        inline: bool,
        ordinal: i32,
        require: i32,
        expect: i32,
        slice: Slice,
    },
    Overwrite {
        handler: HandlerRef,
        method: MethodKey,
    },
    ModifyArg {
        handler: HandlerRef,
        method: MethodKey,
        index: i32,
    },
    ModifyReturnValue {
        handler: HandlerRef,
        method: MethodKey,
    },
    ModifyConstant {
        handler: HandlerRef,
        method: MethodKey,
        /// Literal string form of the constant; empty matches by type only.
        constant: String,
    },
    Redirect {
        handler: HandlerRef,
        method: MethodKey,
        target: At,
        slice: Slice,
    },
    Accessor {
        handler: HandlerRef,
        field: String,
        mutable: bool,
    },
    Invoker {
        handler: HandlerRef,
        method: String,
    },
    Copy {
        handler: HandlerRef,
        method: MethodKey,
    },
    RemoveMethod {
        method: MethodKey,
    },
    RemoveSynchronized {
        method: MethodKey,
    },
    ShadowField {
        field: String,
    },
    MutableField {
        field: String,
    },
    FinalField {
        field: String,
    },
}

/// Class-level replace-all-methods directive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaceAllMethods {
    pub remove_sync: bool,
}

/// Everything the registry needs to know about one parsed mixin class.
#[derive(Clone, Debug)]
pub struct MixinInfo {
    /// Internal names of exact-match targets, in declaration order.
    pub targets: Vec<String>,
    pub directives: Vec<Directive>,
    pub replace_all: Option<ReplaceAllMethods>,
    /// Mixin methods declared `@Shadow`, by handler key. Used by the inline
    /// generator to rebind member references.
    pub shadow_methods: Vec<(HandlerRef, String)>,
    /// `@Copy` handlers with their declared target name, for call rebinding.
    pub copies: Vec<(HandlerRef, String)>,
}

fn find_api<'a>(annotations: &'a [Annotation], simple_name: &str) -> Option<&'a Annotation> {
    let descriptor = api_descriptor(simple_name);
    annotations.iter().find(|annotation| annotation.descriptor == descriptor)
}

fn handler_ref(method: &MethodNode) -> HandlerRef {
    HandlerRef {
        name: method.name.clone(),
        descriptor: method.descriptor.clone(),
        is_static: method.is_static(),
    }
}

/// Target method key from a `method` element: `name`, `name(desc)` or
/// `owner.name(desc)`. Empty means "the handler's own name".
fn method_key(reference: &str, handler: &MethodNode) -> MethodKey {
    if reference.is_empty() {
        return MethodKey { name: handler.name.clone(), descriptor: None };
    }
    let (_, name, descriptor) = method_descriptor_parse(reference);
    MethodKey {
        name,
        descriptor: if descriptor.is_empty() { None } else { Some(descriptor) },
    }
}

fn parse_shift(annotation: &Annotation) -> Shift {
    let value = annotation
        .get("shift")
        .and_then(|value| value.as_enum_value().or_else(|| value.as_str()));
    match value {
        Some("AFTER") => Shift::After,
        Some("REPLACE") => Shift::Replace,
        _ => Shift::Before,
    }
}

fn parse_at(value: Option<&AnnotationValue>) -> Option<At> {
    let annotation = value?.as_annotation()?;
    Some(At {
        target: annotation.str_or("target", ""),
        shift: parse_shift(annotation),
    })
}

fn parse_slice(value: Option<&AnnotationValue>) -> Slice {
    match value.and_then(AnnotationValue::as_annotation) {
        Some(annotation) => Slice {
            from: parse_at(annotation.get("from")),
            to: parse_at(annotation.get("to")),
        },
        None => Slice::default(),
    }
}

fn parse_injection_point(annotation: &Annotation) -> Result<InjectionPoint> {
    let value = annotation
        .get("target")
        .and_then(|value| value.as_enum_value().or_else(|| value.as_str()))
        .unwrap_or("HEAD");
    let point = match value {
        "HEAD" => InjectionPoint::Head,
        "TAIL" => InjectionPoint::Tail,
        "RETURN" => InjectionPoint::Return,
        "INVOKE" => InjectionPoint::Invoke,
        other => bail!("unknown injection point `{other}`"),
    };
    Ok(point)
}

/// Internal name from an `AsmMixin` target element, accepting both dotted
/// and slashed spellings.
fn internal_name(raw: &str) -> String {
    raw.replace('.', "/")
}

/// Parse the mixin metadata of a class into targets and directives.
pub fn parse_mixin(class: &ClassNode) -> Result<MixinInfo> {
    let mixin = find_api(&class.annotations, "AsmMixin")
        .with_context(|| format!("{} carries no AsmMixin annotation", class.name))?;

    let mut targets = Vec::new();
    if let Some(value) = mixin.get("value").and_then(AnnotationValue::as_class) {
        targets.push(value.to_string());
    }
    if let Some(values) = mixin.get("targets").and_then(AnnotationValue::as_array) {
        for value in values {
            match value {
                AnnotationValue::Str(name) => targets.push(internal_name(name)),
                AnnotationValue::Class(_) => {
                    targets.push(value.as_class().unwrap_or_default().to_string());
                }
                other => bail!("unsupported AsmMixin target element {other:?}"),
            }
        }
    }

    let replace_all = find_api(&class.annotations, "ReplaceAllMethods").map(|annotation| {
        ReplaceAllMethods { remove_sync: annotation.bool_or("removeSync", false) }
    });

    let mut directives = Vec::new();
    let mut shadow_methods = Vec::new();
    let mut copies = Vec::new();

    for field in &class.fields {
        directives.extend(field_directives(field));
    }
    for method in &class.methods {
        let (method_directives, shadow, copy) = method_directives(method)
            .with_context(|| format!("parse directives on {}", method.key()))?;
        directives.extend(method_directives);
        shadow_methods.extend(shadow);
        copies.extend(copy);
    }

    Ok(MixinInfo { targets, directives, replace_all, shadow_methods, copies })
}

fn field_directives(field: &FieldNode) -> Vec<Directive> {
    let mut directives = Vec::new();
    if find_api(&field.annotations, "Shadow").is_some() {
        directives.push(Directive::ShadowField { field: field.name.clone() });
    }
    if find_api(&field.annotations, "Mutable").is_some() {
        directives.push(Directive::MutableField { field: field.name.clone() });
    }
    if find_api(&field.annotations, "Final").is_some() {
        directives.push(Directive::FinalField { field: field.name.clone() });
    }
    directives
}

type MethodDirectives =
    (Vec<Directive>, Vec<(HandlerRef, String)>, Vec<(HandlerRef, String)>);

fn method_directives(method: &MethodNode) -> Result<MethodDirectives> {
    let handler = handler_ref(method);
    let mut directives = Vec::new();
    let mut shadow = Vec::new();
    let mut copies = Vec::new();

    if let Some(annotation) = find_api(&method.annotations, "AsmInject") {
        let point = parse_injection_point(annotation)?;
        let at = parse_at(annotation.get("at"));
        if point == InjectionPoint::Invoke && at.is_none() {
            bail!("INVOKE injection requires an `at` anchor");
        }
        directives.push(Directive::Inject {
            handler: handler.clone(),
            method: method_key(&annotation.str_or("method", ""), method),
            point,
            at,
            cancellable: annotation.bool_or("cancellable", false),
            inline: annotation.bool_or("inline", false),
            ordinal: annotation.int_or("ordinal", -1),
            require: annotation.int_or("require", -1),
            expect: annotation.int_or("expect", -1),
            slice: parse_slice(annotation.get("slice")),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "Overwrite") {
        let mut key = method_key(&annotation.str_or("method", ""), method);
        // An overwrite handler shares the target signature.
        if key.descriptor.is_none() {
            key.descriptor = Some(method.descriptor.clone());
        }
        directives.push(Directive::Overwrite { handler: handler.clone(), method: key });
    }
    if let Some(annotation) = find_api(&method.annotations, "ModifyArg") {
        directives.push(Directive::ModifyArg {
            handler: handler.clone(),
            method: method_key(&annotation.str_or("method", ""), method),
            index: annotation.int_or("index", 0),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "ModifyReturnValue") {
        directives.push(Directive::ModifyReturnValue {
            handler: handler.clone(),
            method: method_key(&annotation.str_or("method", ""), method),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "ModifyConstant") {
        directives.push(Directive::ModifyConstant {
            handler: handler.clone(),
            method: method_key(&annotation.str_or("method", ""), method),
            constant: annotation.str_or("constant", ""),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "Redirect") {
        let target = parse_at(annotation.get("at"))
            .or_else(|| {
                let reference = annotation.str_or("target", "");
                if reference.is_empty() {
                    None
                } else {
                    Some(At { target: reference, shift: Shift::Replace })
                }
            })
            .context("Redirect requires a target call site")?;
        directives.push(Directive::Redirect {
            handler: handler.clone(),
            method: method_key(&annotation.str_or("method", ""), method),
            target,
            slice: parse_slice(annotation.get("slice")),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "Accessor") {
        let mutable = find_api(&method.annotations, "Mutable").is_some();
        directives.push(Directive::Accessor {
            handler: handler.clone(),
            field: annotation.str_or("value", ""),
            mutable,
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "Invoker") {
        directives.push(Directive::Invoker {
            handler: handler.clone(),
            method: annotation.str_or("value", ""),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "Shadow") {
        let target = annotation.str_or("method", "");
        let name = if !target.is_empty() {
            target
        } else if let Some(stripped) = method.name.strip_prefix("shadow_") {
            stripped.to_string()
        } else {
            method.name.clone()
        };
        shadow.push((handler.clone(), name));
    }
    if let Some(annotation) = find_api(&method.annotations, "Copy") {
        let key = {
            let mut key = method_key(&annotation.str_or("method", ""), method);
            if key.descriptor.is_none() {
                key.descriptor = Some(method.descriptor.clone());
            }
            key
        };
        copies.push((handler.clone(), key.name.clone()));
        directives.push(Directive::Copy { handler: handler.clone(), method: key });
    }
    if let Some(annotation) = find_api(&method.annotations, "RemoveMethod") {
        directives.push(Directive::RemoveMethod {
            method: method_key(&annotation.str_or("method", ""), method),
        });
    }
    if let Some(annotation) = find_api(&method.annotations, "RemoveSynchronized") {
        directives.push(Directive::RemoveSynchronized {
            method: method_key(&annotation.str_or("method", ""), method),
        });
    }

    Ok((directives, shadow, copies))
}

/// The shadowed target-member name for a mixin field: the `shadow_` prefix
/// convention applies, otherwise the field's own name.
pub fn shadow_target_name(field_name: &str) -> &str {
    field_name.strip_prefix("shadow_").unwrap_or(field_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ACC_PUBLIC, ACC_STATIC};
    use crate::tree::Annotation;

    fn annotation(simple_name: &str, values: Vec<(&str, AnnotationValue)>) -> Annotation {
        Annotation {
            descriptor: api_descriptor(simple_name),
            visible: true,
            values: values
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    fn mixin_class() -> ClassNode {
        let mut class = ClassNode::new(ACC_PUBLIC, "mixins/TestMixin");
        class.annotations.push(annotation(
            "AsmMixin",
            vec![("targets", AnnotationValue::Array(vec![AnnotationValue::Str(
                "com.example.Test".to_string(),
            )]))],
        ));
        class
    }

    #[test]
    fn parses_targets_from_dotted_names() {
        let info = parse_mixin(&mixin_class()).unwrap();
        assert_eq!(info.targets, vec!["com/example/Test"]);
        assert!(info.directives.is_empty());
        assert!(info.replace_all.is_none());
    }

    #[test]
    fn missing_mixin_annotation_is_an_error() {
        let class = ClassNode::new(ACC_PUBLIC, "mixins/Plain");
        assert!(parse_mixin(&class).is_err());
    }

    #[test]
    fn inject_directive_carries_point_and_flags() {
        let mut class = mixin_class();
        let mut handler = MethodNode::new(ACC_PUBLIC, "onHead", "(Lclassweave/runtime/CallbackInfo;)V");
        handler.annotations.push(annotation(
            "AsmInject",
            vec![
                ("method", AnnotationValue::Str("testA0".to_string())),
                ("target", AnnotationValue::Enum {
                    descriptor: api_descriptor("InjectionPoint"),
                    value: "HEAD".to_string(),
                }),
                ("cancellable", AnnotationValue::Boolean(true)),
            ],
        ));
        class.methods.push(handler);

        let info = parse_mixin(&class).unwrap();
        assert_eq!(info.directives.len(), 1);
        match &info.directives[0] {
            Directive::Inject { method, point, cancellable, ordinal, .. } => {
                assert_eq!(method.name, "testA0");
                assert_eq!(method.descriptor, None);
                assert_eq!(*point, InjectionPoint::Head);
                assert!(*cancellable);
                assert_eq!(*ordinal, -1);
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn overwrite_infers_the_handler_signature() {
        let mut class = mixin_class();
        let mut handler =
            MethodNode::new(ACC_PUBLIC | ACC_STATIC, "testB0", "()Ljava/lang/String;");
        handler.annotations.push(annotation("Overwrite", vec![]));
        class.methods.push(handler);

        let info = parse_mixin(&class).unwrap();
        match &info.directives[0] {
            Directive::Overwrite { method, .. } => {
                assert_eq!(method.name, "testB0");
                assert_eq!(method.descriptor.as_deref(), Some("()Ljava/lang/String;"));
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[test]
    fn invoke_inject_requires_an_anchor() {
        let mut class = mixin_class();
        let mut handler = MethodNode::new(ACC_PUBLIC, "bad", "()V");
        handler.annotations.push(annotation(
            "AsmInject",
            vec![("target", AnnotationValue::Str("INVOKE".to_string()))],
        ));
        class.methods.push(handler);
        assert!(parse_mixin(&class).is_err());
    }

    #[test]
    fn shadow_prefix_is_stripped() {
        assert_eq!(shadow_target_name("shadow_dynamicString"), "dynamicString");
        assert_eq!(shadow_target_name("plain"), "plain");
    }
}
