//! Primitive bytecode helpers shared by every injector: constant
//! classification, boxing/unboxing, load/return opcode selection, and
//! target-reference parsing.

use anyhow::{Context, Result, bail};

use crate::descriptor::{parameter_slots, slot_width};
use crate::opcodes;
use crate::tree::{Const, Insn};

/// The value a constant instruction pushes.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstantOperand {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// A class object, by internal name or array descriptor.
    Type(String),
}

/// True for instructions that push a fixed constant: the `aconst_null`..
/// `dconst_1` family, `ldc`, `bipush`/`sipush`, and the class-object
/// producing type instructions (`checkcast` and later).
pub fn is_constant(insn: &Insn) -> bool {
    match insn {
        Insn::Simple(op) => (opcodes::ACONST_NULL..=opcodes::DCONST_1).contains(op),
        Insn::Int { opcode, .. } => {
            *opcode == opcodes::BIPUSH || *opcode == opcodes::SIPUSH
        }
        Insn::Ldc(_) => true,
        Insn::Type { opcode, .. } => *opcode >= opcodes::CHECKCAST,
        _ => false,
    }
}

/// The value yielded by a constant instruction. Total on the
/// [`is_constant`] subset.
pub fn constant_value(insn: &Insn) -> Option<ConstantOperand> {
    let value = match insn {
        Insn::Simple(opcodes::ACONST_NULL) => ConstantOperand::Null,
        Insn::Simple(op @ opcodes::ICONST_M1..=opcodes::ICONST_5) => {
            ConstantOperand::Int(*op as i32 - opcodes::ICONST_0 as i32)
        }
        Insn::Simple(op @ (opcodes::LCONST_0 | opcodes::LCONST_1)) => {
            ConstantOperand::Long((op - opcodes::LCONST_0) as i64)
        }
        Insn::Simple(op @ opcodes::FCONST_0..=opcodes::FCONST_2) => {
            ConstantOperand::Float((op - opcodes::FCONST_0) as f32)
        }
        Insn::Simple(op @ (opcodes::DCONST_0 | opcodes::DCONST_1)) => {
            ConstantOperand::Double((op - opcodes::DCONST_0) as f64)
        }
        Insn::Int { opcode: opcodes::BIPUSH | opcodes::SIPUSH, operand } => {
            ConstantOperand::Int(*operand)
        }
        Insn::Ldc(constant) => match constant {
            Const::Int(v) => ConstantOperand::Int(*v),
            Const::Float(v) => ConstantOperand::Float(*v),
            Const::Long(v) => ConstantOperand::Long(*v),
            Const::Double(v) => ConstantOperand::Double(*v),
            Const::String(v) => ConstantOperand::String(v.clone()),
            Const::Class(v) => ConstantOperand::Type(v.clone()),
            Const::MethodType(_) | Const::MethodHandle(_) => return None,
        },
        Insn::Type { opcode, class_name } if *opcode >= opcodes::CHECKCAST => {
            ConstantOperand::Type(class_name.clone())
        }
        _ => return None,
    };
    Some(value)
}

/// The JVM type a constant occupies on the operand stack, as a descriptor.
pub fn constant_type(insn: &Insn) -> Option<String> {
    let descriptor = match constant_value(insn)? {
        ConstantOperand::Null => "Ljava/lang/Object;",
        ConstantOperand::Int(_) => "I",
        ConstantOperand::Long(_) => "J",
        ConstantOperand::Float(_) => "F",
        ConstantOperand::Double(_) => "D",
        ConstantOperand::String(_) => "Ljava/lang/String;",
        ConstantOperand::Type(_) => "Ljava/lang/Class;",
    };
    Some(descriptor.to_string())
}

/// Load opcode for a field descriptor.
pub fn load_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'I' | b'Z' | b'B' | b'C' | b'S') => opcodes::ILOAD,
        Some(b'J') => opcodes::LLOAD,
        Some(b'F') => opcodes::FLOAD,
        Some(b'D') => opcodes::DLOAD,
        _ => opcodes::ALOAD,
    }
}

/// Store opcode for a field descriptor.
pub fn store_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'I' | b'Z' | b'B' | b'C' | b'S') => opcodes::ISTORE,
        Some(b'J') => opcodes::LSTORE,
        Some(b'F') => opcodes::FSTORE,
        Some(b'D') => opcodes::DSTORE,
        _ => opcodes::ASTORE,
    }
}

/// Return opcode for a return descriptor.
pub fn return_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'V') => opcodes::RETURN,
        Some(b'I' | b'Z' | b'B' | b'C' | b'S') => opcodes::IRETURN,
        Some(b'J') => opcodes::LRETURN,
        Some(b'F') => opcodes::FRETURN,
        Some(b'D') => opcodes::DRETURN,
        _ => opcodes::ARETURN,
    }
}

/// A parameter-load instruction for the given descriptor and slot.
pub fn load_param(descriptor: &str, var: u16) -> Insn {
    Insn::Var { opcode: load_opcode(descriptor), var }
}

/// The RETURN instruction for the given return descriptor.
pub fn make_return(descriptor: &str) -> Insn {
    Insn::Simple(return_opcode(descriptor))
}

/// Wrapper class and unbox-method name for a primitive descriptor.
fn wrapper(descriptor: &str) -> Option<(&'static str, &'static str, char)> {
    let entry = match descriptor.as_bytes().first()? {
        b'Z' => ("java/lang/Boolean", "booleanValue", 'Z'),
        b'B' => ("java/lang/Byte", "byteValue", 'B'),
        b'C' => ("java/lang/Character", "charValue", 'C'),
        b'S' => ("java/lang/Short", "shortValue", 'S'),
        b'I' => ("java/lang/Integer", "intValue", 'I'),
        b'J' => ("java/lang/Long", "longValue", 'J'),
        b'F' => ("java/lang/Float", "floatValue", 'F'),
        b'D' => ("java/lang/Double", "doubleValue", 'D'),
        _ => return None,
    };
    Some(entry)
}

/// Internal name form of a reference descriptor: `La/b/C;` → `a/b/C`,
/// arrays keep their descriptor form.
pub fn descriptor_to_internal(descriptor: &str) -> String {
    descriptor
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .unwrap_or(descriptor)
        .to_string()
}

/// Instructions boxing the primitive on top of the stack; references are
/// left untouched.
pub fn box_value(descriptor: &str) -> Vec<Insn> {
    match wrapper(descriptor) {
        Some((owner, _, prim)) => vec![Insn::Method {
            opcode: opcodes::INVOKESTATIC,
            owner: owner.to_string(),
            name: "valueOf".to_string(),
            descriptor: format!("({prim})L{owner};"),
            interface: false,
        }],
        None => Vec::new(),
    }
}

/// Instructions turning the `java/lang/Object` on top of the stack into the
/// given type: `pop` for void, `checkcast` for references, and
/// checkcast-plus-`xxxValue` for primitives.
pub fn unbox_value(descriptor: &str) -> Vec<Insn> {
    if descriptor.starts_with('V') {
        return vec![Insn::Simple(opcodes::POP)];
    }
    match wrapper(descriptor) {
        Some((owner, method, prim)) => vec![
            Insn::Type {
                opcode: opcodes::CHECKCAST,
                class_name: owner.to_string(),
            },
            Insn::Method {
                opcode: opcodes::INVOKEVIRTUAL,
                owner: owner.to_string(),
                name: method.to_string(),
                descriptor: format!("(){prim}"),
                interface: false,
            },
        ],
        None => vec![Insn::Type {
            opcode: opcodes::CHECKCAST,
            class_name: descriptor_to_internal(descriptor),
        }],
    }
}

/// Instructions pushing the type-appropriate default: `0`, `0L`, `0.0f`,
/// `0.0`, or `null`. Empty for void.
pub fn default_value(descriptor: &str) -> Vec<Insn> {
    let insn = match descriptor.as_bytes().first() {
        Some(b'V') => return Vec::new(),
        Some(b'I' | b'Z' | b'B' | b'C' | b'S') => Insn::Simple(opcodes::ICONST_0),
        Some(b'J') => Insn::Simple(opcodes::LCONST_0),
        Some(b'F') => Insn::Simple(opcodes::FCONST_0),
        Some(b'D') => Insn::Simple(opcodes::DCONST_0),
        _ => Insn::Simple(opcodes::ACONST_NULL),
    };
    vec![insn]
}

/// Split a `owner.name(descriptor)` target reference. The owner separator is
/// the rightmost `.` or `/` before `(`; missing parts come back as empty
/// strings, never as errors.
pub fn method_descriptor_parse(signature: &str) -> (String, String, String) {
    let (head, descriptor) = match signature.find('(') {
        Some(paren) => (&signature[..paren], signature[paren..].to_string()),
        None => (signature, String::new()),
    };
    match head.rfind(['.', '/']) {
        Some(split) => (
            head[..split].to_string(),
            head[split + 1..].to_string(),
            descriptor,
        ),
        None => (String::new(), head.to_string(), descriptor),
    }
}

/// Operand-stack slot delta of one instruction, including symbolic
/// operands. Pseudo-instructions are zero.
pub fn insn_stack_delta(insn: &Insn) -> Result<i32> {
    let delta = match insn {
        Insn::Label(_) | Insn::Frame(_) | Insn::LineNumber { .. } => 0,
        Insn::Field { opcode, descriptor, .. } => {
            let width = slot_width(descriptor) as i32;
            match *opcode {
                opcodes::GETSTATIC => width,
                opcodes::PUTSTATIC => -width,
                opcodes::GETFIELD => width - 1,
                opcodes::PUTFIELD => -width - 1,
                other => bail!("unexpected field opcode 0x{other:02x}"),
            }
        }
        Insn::Method { opcode, descriptor, .. } => {
            let args = parameter_slots(descriptor)
                .with_context(|| format!("call descriptor `{descriptor}`"))? as i32;
            let ret = slot_width_of_return(descriptor);
            let receiver = if *opcode == opcodes::INVOKESTATIC { 0 } else { 1 };
            ret - args - receiver
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let args = parameter_slots(descriptor)
                .with_context(|| format!("call descriptor `{descriptor}`"))? as i32;
            slot_width_of_return(descriptor) - args
        }
        Insn::Ldc(constant) => match constant {
            Const::Long(_) | Const::Double(_) => 2,
            _ => 1,
        },
        Insn::Int { opcode, .. } => match *opcode {
            opcodes::NEWARRAY => 0,
            _ => 1,
        },
        Insn::Var { opcode, .. } => opcodes::stack_delta(*opcode)
            .with_context(|| format!("var opcode without delta: {opcode:#x}"))?,
        Insn::Iinc { .. } => 0,
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => -1,
        Insn::MultiANewArray { dims, .. } => 1 - *dims as i32,
        // `new` pushes the uninitialized reference; the rest of the type
        // family replaces or tests the top of the stack.
        Insn::Type { opcode, .. } => {
            if *opcode == opcodes::NEW {
                1
            } else {
                0
            }
        }
        Insn::Jump { opcode, .. } | Insn::Simple(opcode) => opcodes::stack_delta(*opcode)
            .with_context(|| format!("opcode without delta: {opcode:#x}"))?,
    };
    Ok(delta)
}

fn slot_width_of_return(descriptor: &str) -> i32 {
    match crate::descriptor::return_descriptor(descriptor).as_bytes().first() {
        Some(b'V') => 0,
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}
