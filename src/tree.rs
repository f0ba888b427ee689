//! Mutable class tree edited by the injectors.
//!
//! The tree mirrors the classfile structure at the granularity the
//! transformer needs: typed instruction nodes, label identities, try/catch
//! ranges, local-variable metadata, and parsed annotations. Labels are plain
//! `u32` identities unique within their owning method; cloning instruction
//! ranges always goes through a fresh-label map so identity is preserved per
//! method and never leaks across methods.

use std::collections::HashMap;

use crate::opcodes;

/// Label identity within a single method.
pub type LabelId = u32;

/// A symbolic reference to a method handle (classfile `CONSTANT_MethodHandle`).
#[derive(Clone, Debug, PartialEq)]
pub struct Handle {
    pub kind: u8,
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub interface: bool,
}

/// A loadable constant-pool value.
#[derive(Clone, Debug, PartialEq)]
pub enum Const {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    /// Internal class name, or an array descriptor such as `[I`.
    Class(String),
    MethodType(String),
    MethodHandle(Handle),
}

/// Bootstrap method for an `invokedynamic` call site.
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapMethod {
    pub handle: Handle,
    pub args: Vec<Const>,
}

/// Verification type used in expanded stack-map frames.
#[derive(Clone, Debug, PartialEq)]
pub enum VType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Internal class name or array descriptor.
    Object(String),
    /// The label of the `new` instruction that produced the value.
    Uninitialized(LabelId),
}

/// An expanded (full) stack-map frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameNode {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

/// Typed instruction node.
#[derive(Clone, Debug, PartialEq)]
pub enum Insn {
    /// Operand-free opcode.
    Simple(u8),
    /// `bipush`, `sipush`, `newarray`.
    Int { opcode: u8, operand: i32 },
    /// Local-variable load/store/ret.
    Var { opcode: u8, var: u16 },
    /// `new`, `anewarray`, `checkcast`, `instanceof`; internal name operand.
    Type { opcode: u8, class_name: String },
    Field {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
    },
    Method {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
        interface: bool,
    },
    InvokeDynamic {
        name: String,
        descriptor: String,
        bootstrap: BootstrapMethod,
    },
    Jump { opcode: u8, label: LabelId },
    Label(LabelId),
    Ldc(Const),
    Iinc { var: u16, delta: i16 },
    TableSwitch {
        low: i32,
        high: i32,
        default: LabelId,
        labels: Vec<LabelId>,
    },
    LookupSwitch {
        default: LabelId,
        pairs: Vec<(i32, LabelId)>,
    },
    MultiANewArray { descriptor: String, dims: u8 },
    Frame(FrameNode),
    LineNumber { line: u16, start: LabelId },
}

impl Insn {
    /// The opcode of an executable instruction; `None` for labels, frames
    /// and line numbers.
    pub fn opcode(&self) -> Option<u8> {
        match self {
            Insn::Simple(opcode)
            | Insn::Int { opcode, .. }
            | Insn::Var { opcode, .. }
            | Insn::Type { opcode, .. }
            | Insn::Field { opcode, .. }
            | Insn::Method { opcode, .. }
            | Insn::Jump { opcode, .. } => Some(*opcode),
            Insn::InvokeDynamic { .. } => Some(opcodes::INVOKEDYNAMIC),
            Insn::Ldc(_) => Some(opcodes::LDC),
            Insn::Iinc { .. } => Some(opcodes::IINC),
            Insn::TableSwitch { .. } => Some(opcodes::TABLESWITCH),
            Insn::LookupSwitch { .. } => Some(opcodes::LOOKUPSWITCH),
            Insn::MultiANewArray { .. } => Some(opcodes::MULTIANEWARRAY),
            Insn::Label(_) | Insn::Frame(_) | Insn::LineNumber { .. } => None,
        }
    }

    /// True for `ireturn`..`return`.
    pub fn is_return(&self) -> bool {
        matches!(self.opcode(), Some(op) if opcodes::is_return(op))
    }

    /// True for the `invoke*` family, including `invokedynamic`.
    pub fn is_invoke(&self) -> bool {
        matches!(self.opcode(), Some(op) if opcodes::is_invoke(op))
    }

    /// True for pseudo-instructions that emit no bytecode.
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Insn::Label(_) | Insn::Frame(_) | Insn::LineNumber { .. })
    }
}

/// An exception-handler range.
#[derive(Clone, Debug, PartialEq)]
pub struct TryCatch {
    pub start: LabelId,
    pub end: LabelId,
    pub handler: LabelId,
    /// `None` catches everything (`finally` ranges).
    pub catch_type: Option<String>,
}

/// A local-variable-table entry.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVar {
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub start: LabelId,
    pub end: LabelId,
    pub index: u16,
}

/// `MethodParameters` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: Option<String>,
    pub access: u16,
}

/// A parsed annotation element value.
#[derive(Clone, Debug, PartialEq)]
pub enum AnnotationValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Str(String),
    Enum { descriptor: String, value: String },
    /// A class literal, kept as its field descriptor (`La/b/C;`).
    Class(String),
    Annotation(Box<Annotation>),
    Array(Vec<AnnotationValue>),
}

impl AnnotationValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnnotationValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AnnotationValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            AnnotationValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The internal name of a class-literal value.
    pub fn as_class(&self) -> Option<&str> {
        match self {
            AnnotationValue::Class(descriptor) => Some(
                descriptor
                    .strip_prefix('L')
                    .and_then(|rest| rest.strip_suffix(';'))
                    .unwrap_or(descriptor),
            ),
            _ => None,
        }
    }

    pub fn as_enum_value(&self) -> Option<&str> {
        match self {
            AnnotationValue::Enum { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_annotation(&self) -> Option<&Annotation> {
        match self {
            AnnotationValue::Annotation(nested) => Some(nested),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AnnotationValue]> {
        match self {
            AnnotationValue::Array(values) => Some(values),
            _ => None,
        }
    }
}

/// A parsed annotation with its element values.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    /// Field descriptor of the annotation type (`Lclassweave/api/AsmInject;`).
    pub descriptor: String,
    pub visible: bool,
    pub values: Vec<(String, AnnotationValue)>,
}

impl Annotation {
    pub fn get(&self, name: &str) -> Option<&AnnotationValue> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// String element with a default when absent.
    pub fn str_or(&self, name: &str, default: &str) -> String {
        self.get(name)
            .and_then(AnnotationValue::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(AnnotationValue::as_bool).unwrap_or(default)
    }

    pub fn int_or(&self, name: &str, default: i32) -> i32 {
        self.get(name).and_then(AnnotationValue::as_int).unwrap_or(default)
    }
}

/// A field of a class.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldNode {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub constant: Option<Const>,
    pub annotations: Vec<Annotation>,
}

impl FieldNode {
    pub fn is_static(&self) -> bool {
        self.access & opcodes::ACC_STATIC != 0
    }

    pub fn is_final(&self) -> bool {
        self.access & opcodes::ACC_FINAL != 0
    }
}

/// A method of a class, owning its instruction list.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodNode {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub exceptions: Vec<String>,
    pub parameters: Vec<Parameter>,
    pub annotations: Vec<Annotation>,
    pub insns: Vec<Insn>,
    pub try_catch: Vec<TryCatch>,
    pub locals: Vec<LocalVar>,
    pub max_stack: u16,
    pub max_locals: u16,
    /// Next free label identity for this method.
    pub next_label: LabelId,
}

impl MethodNode {
    pub fn new(access: u16, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            access,
            name: name.into(),
            descriptor: descriptor.into(),
            signature: None,
            exceptions: Vec::new(),
            parameters: Vec::new(),
            annotations: Vec::new(),
            insns: Vec::new(),
            try_catch: Vec::new(),
            locals: Vec::new(),
            max_stack: 0,
            max_locals: 0,
            next_label: 0,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access & opcodes::ACC_STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & opcodes::ACC_ABSTRACT != 0
    }

    pub fn is_native(&self) -> bool {
        self.access & opcodes::ACC_NATIVE != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn has_code(&self) -> bool {
        !self.insns.is_empty()
    }

    /// `name(descriptor)` key used in diagnostics.
    pub fn key(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    /// Allocate a fresh label identity.
    pub fn new_label(&mut self) -> LabelId {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    /// Allocate a block of fresh local slots, growing `max_locals`.
    pub fn new_local(&mut self, width: u16) -> u16 {
        let index = self.max_locals;
        self.max_locals += width;
        index
    }

    /// Indices of all RETURN-family instructions, in order.
    pub fn return_indices(&self) -> Vec<usize> {
        self.insns
            .iter()
            .enumerate()
            .filter(|(_, insn)| insn.is_return())
            .map(|(index, _)| index)
            .collect()
    }

    /// Recompute `max_locals` from parameter slots and var/iinc operands.
    pub fn recompute_max_locals(&mut self, param_slots: u16) {
        let mut max = param_slots + if self.is_static() { 0 } else { 1 };
        for insn in &self.insns {
            let (index, width) = match insn {
                Insn::Var { opcode, var } => {
                    let wide = matches!(
                        *opcode,
                        opcodes::LLOAD | opcodes::DLOAD | opcodes::LSTORE | opcodes::DSTORE
                    );
                    (*var, if wide { 2 } else { 1 })
                }
                Insn::Iinc { var, .. } => (*var, 1),
                _ => continue,
            };
            max = max.max(index + width);
        }
        self.max_locals = self.max_locals.max(max);
    }
}

/// A parsed class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassNode {
    /// `minor << 16 | major`, as stored in the classfile header.
    pub version: u32,
    pub access: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub signature: Option<String>,
    pub annotations: Vec<Annotation>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<MethodNode>,
}

/// Classfile major version for Java 8, the default for synthesized classes.
pub const V1_8: u32 = 52;

impl ClassNode {
    pub fn new(access: u16, name: impl Into<String>) -> Self {
        Self {
            version: V1_8,
            access,
            name: name.into(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            source_file: None,
            signature: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn is_interface(&self) -> bool {
        self.access & opcodes::ACC_INTERFACE != 0
    }

    /// Unqualified name after the last `/` (and `$` for nested classes).
    pub fn simple_name(&self) -> &str {
        let tail = self.name.rsplit('/').next().unwrap_or(&self.name);
        tail.rsplit('$').next().unwrap_or(tail)
    }

    pub fn field(&self, name: &str) -> Option<&FieldNode> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Look up a method by name, and descriptor when one is supplied.
    pub fn method(&self, name: &str, descriptor: Option<&str>) -> Option<&MethodNode> {
        self.methods.iter().find(|method| {
            method.name == name
                && descriptor.map_or(true, |descriptor| method.descriptor == descriptor)
        })
    }

    pub fn method_index(&self, name: &str, descriptor: Option<&str>) -> Option<usize> {
        self.methods.iter().position(|method| {
            method.name == name
                && descriptor.map_or(true, |descriptor| method.descriptor == descriptor)
        })
    }

    /// All `name(descriptor)` keys, for directive-target-missing warnings.
    pub fn method_keys(&self) -> Vec<String> {
        self.methods.iter().map(MethodNode::key).collect()
    }
}

/// Clone a run of instructions, assigning fresh labels from `method` and
/// remapping every jump, switch, line-number, and frame reference through
/// the fresh-label map. Returns the clone and the source→fresh map so the
/// caller can rewrite try/catch and local-variable ranges too.
pub fn clone_with_fresh_labels(
    insns: &[Insn],
    method: &mut MethodNode,
) -> (Vec<Insn>, HashMap<LabelId, LabelId>) {
    let mut map: HashMap<LabelId, LabelId> = HashMap::new();
    for insn in insns {
        for label in insn_labels(insn) {
            map.entry(label).or_insert_with(|| method.new_label());
        }
    }
    let cloned = insns
        .iter()
        .map(|insn| remap_insn_labels(insn.clone(), &map))
        .collect();
    (cloned, map)
}

fn insn_labels(insn: &Insn) -> Vec<LabelId> {
    match insn {
        Insn::Label(label) => vec![*label],
        Insn::Jump { label, .. } => vec![*label],
        Insn::LineNumber { start, .. } => vec![*start],
        Insn::TableSwitch { default, labels, .. } => {
            let mut all = vec![*default];
            all.extend(labels.iter().copied());
            all
        }
        Insn::LookupSwitch { default, pairs } => {
            let mut all = vec![*default];
            all.extend(pairs.iter().map(|(_, label)| *label));
            all
        }
        Insn::Frame(frame) => frame
            .locals
            .iter()
            .chain(frame.stack.iter())
            .filter_map(|vtype| match vtype {
                VType::Uninitialized(label) => Some(*label),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Rewrite every label in one instruction through `map`; labels missing
/// from the map are kept, which lets callers remap a sub-range in place.
pub fn remap_insn_labels(insn: Insn, map: &HashMap<LabelId, LabelId>) -> Insn {
    let remap = |label: LabelId| map.get(&label).copied().unwrap_or(label);
    match insn {
        Insn::Label(label) => Insn::Label(remap(label)),
        Insn::Jump { opcode, label } => Insn::Jump { opcode, label: remap(label) },
        Insn::LineNumber { line, start } => Insn::LineNumber { line, start: remap(start) },
        Insn::TableSwitch { low, high, default, labels } => Insn::TableSwitch {
            low,
            high,
            default: remap(default),
            labels: labels.into_iter().map(remap).collect(),
        },
        Insn::LookupSwitch { default, pairs } => Insn::LookupSwitch {
            default: remap(default),
            pairs: pairs.into_iter().map(|(key, label)| (key, remap(label))).collect(),
        },
        Insn::Frame(frame) => Insn::Frame(FrameNode {
            locals: frame.locals.into_iter().map(|v| remap_vtype(v, &remap)).collect(),
            stack: frame.stack.into_iter().map(|v| remap_vtype(v, &remap)).collect(),
        }),
        other => other,
    }
}

fn remap_vtype(vtype: VType, remap: &impl Fn(LabelId) -> LabelId) -> VType {
    match vtype {
        VType::Uninitialized(label) => VType::Uninitialized(remap(label)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ALOAD, ARETURN, GOTO, IFEQ};

    fn jump(label: LabelId) -> Insn {
        Insn::Jump { opcode: GOTO, label }
    }

    #[test]
    fn cloning_assigns_fresh_labels_preserving_identity() {
        let mut method = MethodNode::new(opcodes::ACC_PUBLIC, "m", "()V");
        let l0 = method.new_label();
        let l1 = method.new_label();
        let insns = vec![
            Insn::Label(l0),
            Insn::Jump { opcode: IFEQ, label: l1 },
            jump(l0),
            Insn::Label(l1),
        ];
        let (cloned, map) = clone_with_fresh_labels(&insns, &mut method);

        assert_eq!(map.len(), 2);
        let fresh_l0 = map[&l0];
        let fresh_l1 = map[&l1];
        assert_ne!(fresh_l0, l0);
        assert_ne!(fresh_l1, l1);
        assert_eq!(cloned[0], Insn::Label(fresh_l0));
        assert_eq!(cloned[1], Insn::Jump { opcode: IFEQ, label: fresh_l1 });
        assert_eq!(cloned[2], jump(fresh_l0));
        assert_eq!(cloned[3], Insn::Label(fresh_l1));
    }

    #[test]
    fn return_indices_sees_every_return_family_opcode() {
        let mut method = MethodNode::new(opcodes::ACC_PUBLIC, "m", "()Ljava/lang/Object;");
        method.insns = vec![
            Insn::Var { opcode: ALOAD, var: 0 },
            Insn::Simple(ARETURN),
            Insn::Simple(opcodes::RETURN),
        ];
        assert_eq!(method.return_indices(), vec![1, 2]);
    }

    #[test]
    fn recompute_max_locals_counts_wide_slots() {
        let mut method = MethodNode::new(opcodes::ACC_PUBLIC, "m", "(I)V");
        method.insns = vec![
            Insn::Var { opcode: opcodes::LSTORE, var: 4 },
            Insn::Iinc { var: 2, delta: 1 },
        ];
        method.recompute_max_locals(1);
        assert_eq!(method.max_locals, 6);
    }

    #[test]
    fn simple_name_strips_package_and_outer_class() {
        let class = ClassNode::new(opcodes::ACC_PUBLIC, "a/b/Outer$Inner");
        assert_eq!(class.simple_name(), "Inner");
    }

    #[test]
    fn annotation_lookup_returns_defaults_when_absent() {
        let annotation = Annotation {
            descriptor: "Lclassweave/api/AsmInject;".to_string(),
            visible: true,
            values: vec![
                ("method".to_string(), AnnotationValue::Str("testA0".to_string())),
                ("cancellable".to_string(), AnnotationValue::Boolean(true)),
            ],
        };
        assert_eq!(annotation.str_or("method", ""), "testA0");
        assert!(annotation.bool_or("cancellable", false));
        assert_eq!(annotation.int_or("ordinal", -1), -1);
    }
}
