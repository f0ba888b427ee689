//! Runtime dispatch surface: the support classes that transformed code
//! links against at runtime, synthesized as bytecode through the crate's
//! own writer and emitted next to the woven classes.

use crate::opcodes::{
    ACC_ABSTRACT, ACC_FINAL, ACC_INTERFACE, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ACC_SUPER,
};
use crate::opcodes;
use crate::tree::{ClassNode, Const, FieldNode, Insn, MethodNode};

/// Internal name of the per-call callback object.
pub const CALLBACK_INFO: &str = "classweave/runtime/CallbackInfo";
/// Field descriptor of [`CALLBACK_INFO`].
pub const CALLBACK_INFO_DESCRIPTOR: &str = "Lclassweave/runtime/CallbackInfo;";
/// Internal name of the dispatch entry-point class.
pub const DISPATCH: &str = "classweave/runtime/Dispatch";
/// Internal name of the user-installed replacement interface.
pub const REPLACEMENT: &str = "classweave/runtime/Replacement";
/// Shared descriptor of the `invoke`/`invokeIgnore` entry points.
pub const INVOKE_DESCRIPTOR: &str =
    "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/Class;[Ljava/lang/Object;)Ljava/lang/Object;";

const OBJECT: &str = "java/lang/Object";
const HASH_MAP: &str = "java/util/HashMap";

fn method(access: u16, name: &str, descriptor: &str, max_locals: u16, insns: Vec<Insn>) -> MethodNode {
    let mut node = MethodNode::new(access, name, descriptor);
    node.max_locals = max_locals;
    node.insns = insns;
    node
}

fn field(access: u16, name: &str, descriptor: &str) -> FieldNode {
    FieldNode {
        access,
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        signature: None,
        constant: None,
        annotations: Vec::new(),
    }
}

fn virtual_call(owner: &str, name: &str, descriptor: &str) -> Insn {
    Insn::Method {
        opcode: opcodes::INVOKEVIRTUAL,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        interface: false,
    }
}

fn static_call(owner: &str, name: &str, descriptor: &str) -> Insn {
    Insn::Method {
        opcode: opcodes::INVOKESTATIC,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        interface: false,
    }
}

fn aload(var: u16) -> Insn {
    Insn::Var { opcode: opcodes::ALOAD, var }
}

fn object_constructor() -> MethodNode {
    method(
        ACC_PUBLIC,
        "<init>",
        "()V",
        1,
        vec![
            aload(0),
            Insn::Method {
                opcode: opcodes::INVOKESPECIAL,
                owner: OBJECT.to_string(),
                name: "<init>".to_string(),
                descriptor: "()V".to_string(),
                interface: false,
            },
            Insn::Simple(opcodes::RETURN),
        ],
    )
}

/// The `CallbackInfo` class: a mutable cancelled flag and return-value
/// holder handed to inject handlers.
pub fn callback_info_class() -> ClassNode {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER | ACC_FINAL, CALLBACK_INFO);
    class.fields.push(field(ACC_PRIVATE, "cancelled", "Z"));
    class.fields.push(field(ACC_PRIVATE, "returnValue", "Ljava/lang/Object;"));
    class.methods.push(object_constructor());
    class.methods.push(method(
        ACC_PUBLIC,
        "cancel",
        "()V",
        1,
        vec![
            aload(0),
            Insn::Simple(opcodes::ICONST_1),
            Insn::Field {
                opcode: opcodes::PUTFIELD,
                owner: CALLBACK_INFO.to_string(),
                name: "cancelled".to_string(),
                descriptor: "Z".to_string(),
            },
            Insn::Simple(opcodes::RETURN),
        ],
    ));
    class.methods.push(method(
        ACC_PUBLIC,
        "isCancelled",
        "()Z",
        1,
        vec![
            aload(0),
            Insn::Field {
                opcode: opcodes::GETFIELD,
                owner: CALLBACK_INFO.to_string(),
                name: "cancelled".to_string(),
                descriptor: "Z".to_string(),
            },
            Insn::Simple(opcodes::IRETURN),
        ],
    ));
    class.methods.push(method(
        ACC_PUBLIC,
        "setReturnValue",
        "(Ljava/lang/Object;)V",
        2,
        vec![
            aload(0),
            aload(1),
            Insn::Field {
                opcode: opcodes::PUTFIELD,
                owner: CALLBACK_INFO.to_string(),
                name: "returnValue".to_string(),
                descriptor: "Ljava/lang/Object;".to_string(),
            },
            Insn::Simple(opcodes::RETURN),
        ],
    ));
    class.methods.push(method(
        ACC_PUBLIC,
        "getReturnValue",
        "()Ljava/lang/Object;",
        1,
        vec![
            aload(0),
            Insn::Field {
                opcode: opcodes::GETFIELD,
                owner: CALLBACK_INFO.to_string(),
                name: "returnValue".to_string(),
                descriptor: "Ljava/lang/Object;".to_string(),
            },
            Insn::Simple(opcodes::ARETURN),
        ],
    ));
    class
}

/// The `Replacement` single-method interface users install against a
/// descriptor key.
pub fn replacement_class() -> ClassNode {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT, REPLACEMENT);
    class.methods.push(MethodNode::new(
        ACC_PUBLIC | ACC_ABSTRACT,
        "apply",
        "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;",
    ));
    class
}

/// One entry point: look the descriptor up in the replacement map, else
/// take the given fallback.
fn entry_point(name: &str, fallback: &str) -> MethodNode {
    let mut node = MethodNode::new(ACC_PUBLIC | ACC_STATIC, name, INVOKE_DESCRIPTOR);
    let missing = node.new_label();
    node.max_locals = 5;
    node.insns = vec![
        Insn::Field {
            opcode: opcodes::GETSTATIC,
            owner: DISPATCH.to_string(),
            name: "REPLACEMENTS".to_string(),
            descriptor: format!("L{HASH_MAP};"),
        },
        aload(1),
        virtual_call(HASH_MAP, "get", "(Ljava/lang/Object;)Ljava/lang/Object;"),
        Insn::Type { opcode: opcodes::CHECKCAST, class_name: REPLACEMENT.to_string() },
        Insn::Var { opcode: opcodes::ASTORE, var: 4 },
        aload(4),
        Insn::Jump { opcode: opcodes::IFNULL, label: missing },
        aload(4),
        aload(0),
        aload(3),
        Insn::Method {
            opcode: opcodes::INVOKEINTERFACE,
            owner: REPLACEMENT.to_string(),
            name: "apply".to_string(),
            descriptor: "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;".to_string(),
            interface: true,
        },
        Insn::Simple(opcodes::ARETURN),
        Insn::Label(missing),
        aload(0),
        aload(1),
        aload(2),
        static_call(
            DISPATCH,
            fallback,
            "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/Class;)Ljava/lang/Object;",
        ),
        Insn::Simple(opcodes::ARETURN),
    ];
    node
}

/// The type-default table: boxed zeros for primitives, the empty string,
/// empty arrays, `null` otherwise. Parameters: receiver, descriptor, the
/// requested return class.
fn default_value_method() -> MethodNode {
    let mut node = MethodNode::new(
        ACC_PRIVATE | ACC_STATIC,
        "defaultValue",
        "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/Class;)Ljava/lang/Object;",
    );
    node.max_locals = 3;
    let mut insns = Vec::new();
    let primitives: [(&str, Insn, &str); 8] = [
        ("java/lang/Boolean", Insn::Simple(opcodes::ICONST_0), "(Z)Ljava/lang/Boolean;"),
        ("java/lang/Byte", Insn::Simple(opcodes::ICONST_0), "(B)Ljava/lang/Byte;"),
        ("java/lang/Character", Insn::Simple(opcodes::ICONST_0), "(C)Ljava/lang/Character;"),
        ("java/lang/Short", Insn::Simple(opcodes::ICONST_0), "(S)Ljava/lang/Short;"),
        ("java/lang/Integer", Insn::Simple(opcodes::ICONST_0), "(I)Ljava/lang/Integer;"),
        ("java/lang/Long", Insn::Simple(opcodes::LCONST_0), "(J)Ljava/lang/Long;"),
        ("java/lang/Float", Insn::Simple(opcodes::FCONST_0), "(F)Ljava/lang/Float;"),
        ("java/lang/Double", Insn::Simple(opcodes::DCONST_0), "(D)Ljava/lang/Double;"),
    ];
    for (wrapper, zero, valueof) in primitives {
        let next = node.new_label();
        insns.push(Insn::Field {
            opcode: opcodes::GETSTATIC,
            owner: wrapper.to_string(),
            name: "TYPE".to_string(),
            descriptor: "Ljava/lang/Class;".to_string(),
        });
        insns.push(aload(2));
        insns.push(Insn::Jump { opcode: opcodes::IF_ACMPNE, label: next });
        insns.push(zero);
        insns.push(static_call(wrapper, "valueOf", valueof));
        insns.push(Insn::Simple(opcodes::ARETURN));
        insns.push(Insn::Label(next));
    }
    let not_string = node.new_label();
    insns.push(Insn::Ldc(Const::Class("java/lang/String".to_string())));
    insns.push(aload(2));
    insns.push(Insn::Jump { opcode: opcodes::IF_ACMPNE, label: not_string });
    insns.push(Insn::Ldc(Const::String(String::new())));
    insns.push(Insn::Simple(opcodes::ARETURN));
    insns.push(Insn::Label(not_string));
    let not_array = node.new_label();
    insns.push(aload(2));
    insns.push(virtual_call("java/lang/Class", "isArray", "()Z"));
    insns.push(Insn::Jump { opcode: opcodes::IFEQ, label: not_array });
    insns.push(aload(2));
    insns.push(virtual_call("java/lang/Class", "getComponentType", "()Ljava/lang/Class;"));
    insns.push(Insn::Simple(opcodes::ICONST_0));
    insns.push(static_call(
        "java/lang/reflect/Array",
        "newInstance",
        "(Ljava/lang/Class;I)Ljava/lang/Object;",
    ));
    insns.push(Insn::Simple(opcodes::ARETURN));
    insns.push(Insn::Label(not_array));
    insns.push(Insn::Simple(opcodes::ACONST_NULL));
    insns.push(Insn::Simple(opcodes::ARETURN));
    node.insns = insns;
    node
}

/// The fallback behind `invoke`: cast-prefixed descriptors return the
/// receiver unchanged when it already is an instance of the requested
/// class (such descriptors carry no caller information, a known
/// limitation); everything else takes the type-default table.
fn fallback_method() -> MethodNode {
    let mut node = MethodNode::new(
        ACC_PRIVATE | ACC_STATIC,
        "fallback",
        "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/Class;)Ljava/lang/Object;",
    );
    node.max_locals = 3;
    let not_cast = node.new_label();
    let not_instance = node.new_label();
    node.insns = vec![
        aload(1),
        Insn::Ldc(Const::String("<cast> ".to_string())),
        virtual_call("java/lang/String", "startsWith", "(Ljava/lang/String;)Z"),
        Insn::Jump { opcode: opcodes::IFEQ, label: not_cast },
        aload(2),
        aload(0),
        virtual_call("java/lang/Class", "isInstance", "(Ljava/lang/Object;)Z"),
        Insn::Jump { opcode: opcodes::IFEQ, label: not_instance },
        aload(0),
        Insn::Simple(opcodes::ARETURN),
        Insn::Label(not_instance),
        Insn::Simple(opcodes::ACONST_NULL),
        Insn::Simple(opcodes::ARETURN),
        Insn::Label(not_cast),
        aload(0),
        aload(1),
        aload(2),
        static_call(
            DISPATCH,
            "defaultValue",
            "(Ljava/lang/Object;Ljava/lang/String;Ljava/lang/Class;)Ljava/lang/Object;",
        ),
        Insn::Simple(opcodes::ARETURN),
    ];
    node
}

/// The `Dispatch` class: the replacement map, the installer, and the two
/// entry points transformed code calls into.
pub fn dispatch_class() -> ClassNode {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER | ACC_FINAL, DISPATCH);
    class.fields.push(field(
        ACC_PRIVATE | ACC_STATIC | ACC_FINAL,
        "REPLACEMENTS",
        &format!("L{HASH_MAP};"),
    ));
    class.methods.push(method(
        ACC_STATIC,
        "<clinit>",
        "()V",
        0,
        vec![
            Insn::Type { opcode: opcodes::NEW, class_name: HASH_MAP.to_string() },
            Insn::Simple(opcodes::DUP),
            Insn::Method {
                opcode: opcodes::INVOKESPECIAL,
                owner: HASH_MAP.to_string(),
                name: "<init>".to_string(),
                descriptor: "()V".to_string(),
                interface: false,
            },
            Insn::Field {
                opcode: opcodes::PUTSTATIC,
                owner: DISPATCH.to_string(),
                name: "REPLACEMENTS".to_string(),
                descriptor: format!("L{HASH_MAP};"),
            },
            Insn::Simple(opcodes::RETURN),
        ],
    ));
    // The class is all statics; nobody instantiates it.
    let mut private_constructor = object_constructor();
    private_constructor.access = ACC_PRIVATE;
    class.methods.push(private_constructor);
    class.methods.push(method(
        ACC_PUBLIC | ACC_STATIC,
        "install",
        &format!("(Ljava/lang/String;L{REPLACEMENT};)V"),
        2,
        vec![
            Insn::Field {
                opcode: opcodes::GETSTATIC,
                owner: DISPATCH.to_string(),
                name: "REPLACEMENTS".to_string(),
                descriptor: format!("L{HASH_MAP};"),
            },
            aload(0),
            aload(1),
            virtual_call(
                HASH_MAP,
                "put",
                "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
            ),
            Insn::Simple(opcodes::POP),
            Insn::Simple(opcodes::RETURN),
        ],
    ));
    class.methods.push(entry_point("invoke", "fallback"));
    class.methods.push(entry_point("invokeIgnore", "defaultValue"));
    class.methods.push(fallback_method());
    class.methods.push(default_value_method());
    class
}

/// Every runtime support class, in emission order.
pub fn runtime_classes() -> Vec<ClassNode> {
    vec![callback_info_class(), replacement_class(), dispatch_class()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{self, NoResolver};

    #[test]
    fn runtime_classes_serialize_and_reparse() {
        for class in runtime_classes() {
            let name = class.name.clone();
            let bytes = classfile::write(&class, &NoResolver)
                .unwrap_or_else(|err| panic!("write {name}: {err:?}"));
            let reparsed = classfile::parse(&bytes).unwrap();
            assert_eq!(reparsed.name, name);
        }
    }

    #[test]
    fn callback_info_exposes_the_callback_protocol() {
        let class = callback_info_class();
        assert_eq!(class.name, CALLBACK_INFO);
        for (name, descriptor) in [
            ("cancel", "()V"),
            ("isCancelled", "()Z"),
            ("setReturnValue", "(Ljava/lang/Object;)V"),
            ("getReturnValue", "()Ljava/lang/Object;"),
        ] {
            assert!(
                class.method(name, Some(descriptor)).is_some(),
                "missing {name}{descriptor}"
            );
        }
    }

    #[test]
    fn dispatch_has_both_entry_points_with_the_shared_descriptor() {
        let class = dispatch_class();
        assert!(class.method("invoke", Some(INVOKE_DESCRIPTOR)).is_some());
        assert!(class.method("invokeIgnore", Some(INVOKE_DESCRIPTOR)).is_some());
        assert!(class.method("install", None).is_some());
        // invoke keeps the cast-aware fallback, invokeIgnore goes straight
        // to the default table.
        let calls = |name: &str| -> Vec<String> {
            class
                .method(name, Some(INVOKE_DESCRIPTOR))
                .unwrap()
                .insns
                .iter()
                .filter_map(|insn| match insn {
                    Insn::Method { owner, name, .. } if owner == DISPATCH => Some(name.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(calls("invoke"), vec!["fallback"]);
        assert_eq!(calls("invokeIgnore"), vec!["defaultValue"]);
    }

    #[test]
    fn replacement_is_a_single_method_interface() {
        let class = replacement_class();
        assert!(class.is_interface());
        assert_eq!(class.methods.len(), 1);
        assert!(class.methods[0].is_abstract());
    }
}
