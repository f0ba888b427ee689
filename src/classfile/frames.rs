//! Stack-map frame and `max_stack` recomputation.
//!
//! A deterministic worklist dataflow over the instruction list infers the
//! verification types at every basic-block boundary. Frames are emitted for
//! branch targets and exception handlers only, always in full-frame form.
//! Reference merges resolve common superclasses through
//! [`SuperclassResolver`]; everything unknown merges to `java/lang/Object`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::{Context, Result, bail};

use crate::bytecode::descriptor_to_internal;
use crate::descriptor::{parameter_descriptors, return_descriptor};
use crate::opcodes;
use crate::tree::{Insn, LabelId, MethodNode};

/// Resolves superclasses during frame merges. Implementations back this
/// with whatever hierarchy knowledge the host has; unknown names are
/// treated as direct subclasses of `java/lang/Object`.
pub trait SuperclassResolver: Send + Sync {
    /// The superclass of `name`, or `None` when unknown (or `name` is
    /// `java/lang/Object`).
    fn super_name(&self, name: &str) -> Option<String>;
}

/// Resolver that knows nothing; every merge of distinct types yields
/// `java/lang/Object`.
pub struct NoResolver;

impl SuperclassResolver for NoResolver {
    fn super_name(&self, _name: &str) -> Option<String> {
        None
    }
}

/// The nearest common superclass of two internal names.
pub fn common_superclass(resolver: &dyn SuperclassResolver, a: &str, b: &str) -> String {
    if a == b {
        return a.to_string();
    }
    if a.starts_with('[') || b.starts_with('[') {
        return "java/lang/Object".to_string();
    }
    let mut ancestors = Vec::new();
    let mut current = Some(a.to_string());
    while let Some(name) = current {
        ancestors.push(name.clone());
        current = resolver.super_name(&name);
    }
    let mut current = Some(b.to_string());
    while let Some(name) = current {
        if ancestors.iter().any(|ancestor| ancestor == &name) {
            return name;
        }
        current = resolver.super_name(&name);
    }
    "java/lang/Object".to_string()
}

/// Verification type as emitted into the `StackMapTable`.
#[derive(Clone, Debug, PartialEq)]
pub enum VerifType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Internal name or array descriptor.
    Object(String),
    /// Bytecode offset of the allocating `new`.
    Uninitialized(u32),
}

impl VerifType {
    fn width(&self) -> u32 {
        match self {
            VerifType::Long | VerifType::Double => 2,
            _ => 1,
        }
    }
}

/// One full frame at a bytecode offset.
#[derive(Clone, Debug, PartialEq)]
pub struct StackMapFrame {
    pub offset: u32,
    /// Entry-based locals: wide types occupy one entry.
    pub locals: Vec<VerifType>,
    pub stack: Vec<VerifType>,
}

/// Result of the dataflow pass over one method body.
pub struct ComputedCode {
    pub max_stack: u16,
    pub frames: Vec<StackMapFrame>,
}

#[derive(Clone, Debug, PartialEq)]
struct State {
    /// Slot-based locals: a wide type is followed by an explicit `Top`.
    locals: Vec<VerifType>,
    stack: Vec<VerifType>,
}

impl State {
    fn stack_slots(&self) -> u32 {
        self.stack.iter().map(VerifType::width).sum()
    }
}

struct MethodShape<'a> {
    class_name: &'a str,
    insns: &'a [Insn],
    /// Bytecode offset of every instruction index.
    offsets: &'a [u32],
    /// Instruction index of every label.
    label_index: HashMap<LabelId, usize>,
    /// Class allocated by the `new` instruction at each offset.
    new_types: HashMap<u32, String>,
}

/// Compute `max_stack` and the stack-map frames for a laid-out method.
/// `offsets` carries the bytecode offset of every instruction index.
pub fn compute(
    class_name: &str,
    method: &MethodNode,
    offsets: &[u32],
    resolver: &dyn SuperclassResolver,
) -> Result<ComputedCode> {
    let insns = &method.insns;
    let mut label_index = HashMap::new();
    let mut new_types = HashMap::new();
    for (index, insn) in insns.iter().enumerate() {
        match insn {
            Insn::Label(label) => {
                label_index.insert(*label, index);
            }
            Insn::Type { opcode: opcodes::NEW, class_name } => {
                new_types.insert(offsets[index], class_name.clone());
            }
            _ => {}
        }
    }
    let shape = MethodShape { class_name, insns, offsets, label_index, new_types };

    // Frames are required at branch targets and handler entries.
    let mut required: Vec<LabelId> = Vec::new();
    for insn in insns {
        match insn {
            Insn::Jump { label, .. } => required.push(*label),
            Insn::TableSwitch { default, labels, .. } => {
                required.push(*default);
                required.extend(labels.iter().copied());
            }
            Insn::LookupSwitch { default, pairs } => {
                required.push(*default);
                required.extend(pairs.iter().map(|(_, label)| *label));
            }
            _ => {}
        }
    }
    for range in &method.try_catch {
        required.push(range.handler);
    }

    let handlers: Vec<(usize, usize, usize, VerifType)> = method
        .try_catch
        .iter()
        .map(|range| {
            let start = *shape
                .label_index
                .get(&range.start)
                .context("try/catch start label missing")?;
            let end = *shape
                .label_index
                .get(&range.end)
                .context("try/catch end label missing")?;
            let handler = *shape
                .label_index
                .get(&range.handler)
                .context("try/catch handler label missing")?;
            let catch = VerifType::Object(
                range.catch_type.clone().unwrap_or_else(|| "java/lang/Throwable".to_string()),
            );
            Ok((start, end, handler, catch))
        })
        .collect::<Result<_>>()?;

    let mut block_states: BTreeMap<usize, State> = BTreeMap::new();
    let mut worklist = VecDeque::new();
    let entry = initial_state(class_name, method)?;
    let max_locals = entry.locals.len() as u32;
    block_states.insert(0, entry);
    worklist.push_back(0usize);

    let mut max_stack: u32 = 0;
    let mut max_locals = max_locals;
    let mut iterations = 0usize;
    while let Some(start) = worklist.pop_front() {
        iterations += 1;
        if iterations > insns.len().saturating_mul(64) + 4096 {
            bail!("frame computation did not converge");
        }
        let mut state = block_states.get(&start).cloned().context("missing block state")?;
        let mut index = start;
        while index < insns.len() {
            let insn = &insns[index];
            if index != start {
                if let Insn::Label(label) = insn {
                    if is_block_start(&shape, &handlers, *label) {
                        merge_into(
                            &mut block_states,
                            &mut worklist,
                            shape.label_index[label],
                            &state,
                            resolver,
                        )?;
                        break;
                    }
                }
            }
            if insn.is_pseudo() {
                index += 1;
                continue;
            }
            // Exception edges observe the locals before the instruction.
            for (start_idx, end_idx, handler_idx, catch) in &handlers {
                if index >= *start_idx && index < *end_idx {
                    let handler_state =
                        State { locals: state.locals.clone(), stack: vec![catch.clone()] };
                    merge_into(
                        &mut block_states,
                        &mut worklist,
                        *handler_idx,
                        &handler_state,
                        resolver,
                    )?;
                }
            }
            let flow = step(&mut state, insn, shape.offsets[index], &shape)
                .with_context(|| format!("at instruction index {index}"))?;
            max_stack = max_stack.max(state.stack_slots());
            max_locals = max_locals.max(state.locals.len() as u32);
            match flow {
                Flow::Next => {}
                Flow::Branch(label) => {
                    let target = *shape
                        .label_index
                        .get(&label)
                        .context("jump to label missing from method")?;
                    merge_into(&mut block_states, &mut worklist, target, &state, resolver)?;
                }
                Flow::BranchAlways(label) => {
                    let target = *shape
                        .label_index
                        .get(&label)
                        .context("jump to label missing from method")?;
                    merge_into(&mut block_states, &mut worklist, target, &state, resolver)?;
                    break;
                }
                Flow::Switch(targets) => {
                    for label in targets {
                        let target = *shape
                            .label_index
                            .get(&label)
                            .context("switch target missing from method")?;
                        merge_into(&mut block_states, &mut worklist, target, &state, resolver)?;
                    }
                    break;
                }
                Flow::End => break,
            }
            index += 1;
        }
    }

    if max_locals > u16::MAX as u32 {
        bail!("max_locals {max_locals} exceeds the classfile limit");
    }

    let mut required_offsets: BTreeMap<u32, usize> = BTreeMap::new();
    for label in required {
        let index = *shape
            .label_index
            .get(&label)
            .context("branch target label missing from method")?;
        required_offsets.insert(offsets[index], index);
    }
    let mut frames = Vec::with_capacity(required_offsets.len());
    for (offset, index) in required_offsets {
        let state = block_states
            .get(&index)
            .with_context(|| format!("unreachable code at offset {offset}"))?;
        frames.push(StackMapFrame {
            offset,
            locals: entry_locals(&state.locals),
            stack: state.stack.clone(),
        });
    }

    Ok(ComputedCode { max_stack: max_stack.min(u16::MAX as u32) as u16, frames })
}

fn is_block_start(
    shape: &MethodShape,
    handlers: &[(usize, usize, usize, VerifType)],
    label: LabelId,
) -> bool {
    let index = match shape.label_index.get(&label) {
        Some(index) => *index,
        None => return false,
    };
    if handlers.iter().any(|(_, _, handler, _)| *handler == index) {
        return true;
    }
    shape.insns.iter().any(|insn| match insn {
        Insn::Jump { label: target, .. } => *target == label,
        Insn::TableSwitch { default, labels, .. } => {
            *default == label || labels.contains(&label)
        }
        Insn::LookupSwitch { default, pairs } => {
            *default == label || pairs.iter().any(|(_, target)| *target == label)
        }
        _ => false,
    })
}

fn initial_state(class_name: &str, method: &MethodNode) -> Result<State> {
    let mut locals = Vec::new();
    if !method.is_static() {
        if method.is_constructor() {
            locals.push(VerifType::UninitializedThis);
        } else {
            locals.push(VerifType::Object(class_name.to_string()));
        }
    }
    for parameter in parameter_descriptors(&method.descriptor)? {
        let vtype = vtype_of_descriptor(&parameter);
        let wide = vtype.width() == 2;
        locals.push(vtype);
        if wide {
            locals.push(VerifType::Top);
        }
    }
    Ok(State { locals, stack: Vec::new() })
}

fn vtype_of_descriptor(descriptor: &str) -> VerifType {
    match descriptor.as_bytes().first() {
        Some(b'I' | b'Z' | b'B' | b'C' | b'S') => VerifType::Int,
        Some(b'F') => VerifType::Float,
        Some(b'J') => VerifType::Long,
        Some(b'D') => VerifType::Double,
        Some(b'[') => VerifType::Object(descriptor.to_string()),
        _ => VerifType::Object(descriptor_to_internal(descriptor)),
    }
}

/// Collapse slot-based locals into frame entries and trim trailing tops.
fn entry_locals(slots: &[VerifType]) -> Vec<VerifType> {
    let mut entries = Vec::with_capacity(slots.len());
    let mut index = 0;
    while index < slots.len() {
        let slot = slots[index].clone();
        let wide = slot.width() == 2;
        entries.push(slot);
        index += if wide { 2 } else { 1 };
    }
    while matches!(entries.last(), Some(VerifType::Top)) {
        entries.pop();
    }
    entries
}

fn merge_into(
    states: &mut BTreeMap<usize, State>,
    worklist: &mut VecDeque<usize>,
    target: usize,
    incoming: &State,
    resolver: &dyn SuperclassResolver,
) -> Result<()> {
    match states.get_mut(&target) {
        None => {
            states.insert(target, incoming.clone());
            worklist.push_back(target);
        }
        Some(existing) => {
            let mut changed = false;
            let locals_len = existing.locals.len().max(incoming.locals.len());
            let mut merged_locals = Vec::with_capacity(locals_len);
            for slot in 0..locals_len {
                let left = existing.locals.get(slot).cloned().unwrap_or(VerifType::Top);
                let right = incoming.locals.get(slot).cloned().unwrap_or(VerifType::Top);
                merged_locals.push(merge_vtype(left, right, resolver));
            }
            if merged_locals != existing.locals {
                existing.locals = merged_locals;
                changed = true;
            }
            if existing.stack.len() != incoming.stack.len() {
                bail!(
                    "inconsistent stack depth at merge: {} vs {}",
                    existing.stack.len(),
                    incoming.stack.len()
                );
            }
            let merged_stack: Vec<VerifType> = existing
                .stack
                .iter()
                .zip(incoming.stack.iter())
                .map(|(left, right)| merge_vtype(left.clone(), right.clone(), resolver))
                .collect();
            if merged_stack != existing.stack {
                existing.stack = merged_stack;
                changed = true;
            }
            if changed && !worklist.contains(&target) {
                worklist.push_back(target);
            }
        }
    }
    Ok(())
}

fn merge_vtype(left: VerifType, right: VerifType, resolver: &dyn SuperclassResolver) -> VerifType {
    if left == right {
        return left;
    }
    match (left, right) {
        (VerifType::Null, other @ VerifType::Object(_))
        | (other @ VerifType::Object(_), VerifType::Null) => other,
        (VerifType::Object(a), VerifType::Object(b)) => {
            VerifType::Object(common_superclass(resolver, &a, &b))
        }
        _ => VerifType::Top,
    }
}

enum Flow {
    Next,
    Branch(LabelId),
    BranchAlways(LabelId),
    Switch(Vec<LabelId>),
    End,
}

fn pop(state: &mut State) -> Result<VerifType> {
    state.stack.pop().context("operand stack underflow")
}

fn pop_n(state: &mut State, count: usize) -> Result<()> {
    for _ in 0..count {
        pop(state)?;
    }
    Ok(())
}

fn store_local(state: &mut State, var: u16, vtype: VerifType) {
    let var = var as usize;
    let wide = vtype.width() == 2;
    let needed = var + if wide { 2 } else { 1 };
    if state.locals.len() < needed {
        state.locals.resize(needed, VerifType::Top);
    }
    // Overwriting the second slot of a wide pair invalidates the pair.
    if var > 0 && state.locals[var - 1].width() == 2 {
        state.locals[var - 1] = VerifType::Top;
    }
    state.locals[var] = vtype;
    if wide {
        state.locals[var + 1] = VerifType::Top;
    }
}

fn load_local(state: &State, var: u16) -> Result<VerifType> {
    state
        .locals
        .get(var as usize)
        .cloned()
        .with_context(|| format!("load from undefined local {var}"))
}

fn step(state: &mut State, insn: &Insn, offset: u32, shape: &MethodShape) -> Result<Flow> {
    use crate::tree::Const;
    use opcodes as op;

    match insn {
        Insn::Label(_) | Insn::Frame(_) | Insn::LineNumber { .. } => Ok(Flow::Next),
        Insn::Ldc(constant) => {
            let vtype = match constant {
                Const::Int(_) => VerifType::Int,
                Const::Float(_) => VerifType::Float,
                Const::Long(_) => VerifType::Long,
                Const::Double(_) => VerifType::Double,
                Const::String(_) => VerifType::Object("java/lang/String".to_string()),
                Const::Class(_) => VerifType::Object("java/lang/Class".to_string()),
                Const::MethodType(_) => {
                    VerifType::Object("java/lang/invoke/MethodType".to_string())
                }
                Const::MethodHandle(_) => {
                    VerifType::Object("java/lang/invoke/MethodHandle".to_string())
                }
            };
            state.stack.push(vtype);
            Ok(Flow::Next)
        }
        Insn::Int { opcode: op::NEWARRAY, operand } => {
            pop(state)?;
            let descriptor = match operand {
                4 => "[Z",
                5 => "[C",
                6 => "[F",
                7 => "[D",
                8 => "[B",
                9 => "[S",
                10 => "[I",
                11 => "[J",
                other => bail!("invalid newarray type {other}"),
            };
            state.stack.push(VerifType::Object(descriptor.to_string()));
            Ok(Flow::Next)
        }
        Insn::Int { .. } => {
            state.stack.push(VerifType::Int);
            Ok(Flow::Next)
        }
        Insn::Var { opcode, var } => {
            match *opcode {
                op::ILOAD => state.stack.push(VerifType::Int),
                op::FLOAD => state.stack.push(VerifType::Float),
                op::LLOAD => state.stack.push(VerifType::Long),
                op::DLOAD => state.stack.push(VerifType::Double),
                op::ALOAD => {
                    let vtype = load_local(state, *var)?;
                    state.stack.push(vtype);
                }
                op::ISTORE => {
                    pop(state)?;
                    store_local(state, *var, VerifType::Int);
                }
                op::FSTORE => {
                    pop(state)?;
                    store_local(state, *var, VerifType::Float);
                }
                op::LSTORE => {
                    pop(state)?;
                    store_local(state, *var, VerifType::Long);
                }
                op::DSTORE => {
                    pop(state)?;
                    store_local(state, *var, VerifType::Double);
                }
                op::ASTORE => {
                    let vtype = pop(state)?;
                    store_local(state, *var, vtype);
                }
                op::RET => bail!("jsr/ret bytecode is not supported"),
                other => bail!("unexpected var opcode 0x{other:02x}"),
            }
            Ok(Flow::Next)
        }
        Insn::Iinc { .. } => Ok(Flow::Next),
        Insn::Jump { opcode, label } => match *opcode {
            op::GOTO => Ok(Flow::BranchAlways(*label)),
            op::JSR => bail!("jsr/ret bytecode is not supported"),
            op::IFEQ..=op::IFLE | op::IFNULL | op::IFNONNULL => {
                pop(state)?;
                Ok(Flow::Branch(*label))
            }
            op::IF_ICMPEQ..=op::IF_ACMPNE => {
                pop_n(state, 2)?;
                Ok(Flow::Branch(*label))
            }
            other => bail!("unexpected jump opcode 0x{other:02x}"),
        },
        Insn::TableSwitch { default, labels, .. } => {
            pop(state)?;
            let mut targets = vec![*default];
            targets.extend(labels.iter().copied());
            Ok(Flow::Switch(targets))
        }
        Insn::LookupSwitch { default, pairs } => {
            pop(state)?;
            let mut targets = vec![*default];
            targets.extend(pairs.iter().map(|(_, label)| *label));
            Ok(Flow::Switch(targets))
        }
        Insn::Field { opcode, descriptor, .. } => {
            match *opcode {
                op::GETSTATIC => push_descriptor(state, descriptor),
                op::PUTSTATIC => {
                    pop(state)?;
                }
                op::GETFIELD => {
                    pop(state)?;
                    push_descriptor(state, descriptor);
                }
                op::PUTFIELD => pop_n(state, 2)?,
                other => bail!("unexpected field opcode 0x{other:02x}"),
            }
            Ok(Flow::Next)
        }
        Insn::Method { opcode, name, descriptor, owner, .. } => {
            let params = parameter_descriptors(descriptor)?;
            pop_n(state, params.len())?;
            if *opcode != op::INVOKESTATIC {
                let receiver = pop(state)?;
                if *opcode == op::INVOKESPECIAL && name == "<init>" {
                    initialize(state, receiver, owner, shape)?;
                }
            }
            push_descriptor(state, return_descriptor(descriptor));
            Ok(Flow::Next)
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let params = parameter_descriptors(descriptor)?;
            pop_n(state, params.len())?;
            push_descriptor(state, return_descriptor(descriptor));
            Ok(Flow::Next)
        }
        Insn::Type { opcode, class_name } => {
            match *opcode {
                op::NEW => state.stack.push(VerifType::Uninitialized(offset)),
                op::ANEWARRAY => {
                    pop(state)?;
                    let descriptor = if class_name.starts_with('[') {
                        format!("[{class_name}")
                    } else {
                        format!("[L{class_name};")
                    };
                    state.stack.push(VerifType::Object(descriptor));
                }
                op::CHECKCAST => {
                    pop(state)?;
                    state.stack.push(VerifType::Object(class_name.clone()));
                }
                op::INSTANCEOF => {
                    pop(state)?;
                    state.stack.push(VerifType::Int);
                }
                other => bail!("unexpected type opcode 0x{other:02x}"),
            }
            Ok(Flow::Next)
        }
        Insn::MultiANewArray { descriptor, dims } => {
            pop_n(state, *dims as usize)?;
            state.stack.push(VerifType::Object(descriptor.clone()));
            Ok(Flow::Next)
        }
        Insn::Simple(opcode) => step_simple(state, *opcode),
    }
}

fn push_descriptor(state: &mut State, descriptor: &str) {
    if descriptor.starts_with('V') {
        return;
    }
    state.stack.push(vtype_of_descriptor(descriptor));
}

fn initialize(
    state: &mut State,
    receiver: VerifType,
    owner: &str,
    shape: &MethodShape,
) -> Result<()> {
    let initialized = match &receiver {
        VerifType::UninitializedThis => VerifType::Object(shape.class_name.to_string()),
        VerifType::Uninitialized(new_offset) => VerifType::Object(
            shape
                .new_types
                .get(new_offset)
                .cloned()
                .unwrap_or_else(|| owner.to_string()),
        ),
        // Calling a constructor on an initialized value (e.g. super.<init>
        // forwarding inside copied code) leaves the frame untouched.
        _ => return Ok(()),
    };
    for slot in &mut state.locals {
        if *slot == receiver {
            *slot = initialized.clone();
        }
    }
    for slot in &mut state.stack {
        if *slot == receiver {
            *slot = initialized.clone();
        }
    }
    Ok(())
}

fn step_simple(state: &mut State, opcode: u8) -> Result<Flow> {
    use opcodes as op;

    match opcode {
        op::NOP => {}
        op::ACONST_NULL => state.stack.push(VerifType::Null),
        op::ICONST_M1..=op::ICONST_5 => state.stack.push(VerifType::Int),
        op::LCONST_0 | op::LCONST_1 => state.stack.push(VerifType::Long),
        op::FCONST_0..=op::FCONST_2 => state.stack.push(VerifType::Float),
        op::DCONST_0 | op::DCONST_1 => state.stack.push(VerifType::Double),
        op::IALOAD | op::BALOAD | op::CALOAD | op::SALOAD => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Int);
        }
        op::FALOAD => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Float);
        }
        op::LALOAD => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Long);
        }
        op::DALOAD => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Double);
        }
        op::AALOAD => {
            pop(state)?;
            let array = pop(state)?;
            let element = match &array {
                VerifType::Object(descriptor) if descriptor.starts_with('[') => {
                    vtype_of_descriptor(&descriptor[1..])
                }
                VerifType::Null => VerifType::Null,
                _ => VerifType::Object("java/lang/Object".to_string()),
            };
            state.stack.push(element);
        }
        op::IASTORE..=op::SASTORE => {
            pop_n(state, 3)?;
        }
        op::POP => {
            pop(state)?;
        }
        op::POP2 => {
            let top = pop(state)?;
            if top.width() == 1 {
                pop(state)?;
            }
        }
        op::DUP => {
            let top = state.stack.last().context("dup on empty stack")?.clone();
            state.stack.push(top);
        }
        op::DUP_X1 => dup_slots(state, 1, 1)?,
        op::DUP_X2 => dup_slots(state, 1, 2)?,
        op::DUP2 => dup_slots(state, 2, 0)?,
        op::DUP2_X1 => dup_slots(state, 2, 1)?,
        op::DUP2_X2 => dup_slots(state, 2, 2)?,
        op::SWAP => {
            let first = pop(state)?;
            let second = pop(state)?;
            state.stack.push(first);
            state.stack.push(second);
        }
        // add/sub/mul/div/rem keep the operand category.
        0x60..=0x73 => {
            let result = match (opcode - op::IADD) % 4 {
                0 => VerifType::Int,
                1 => VerifType::Long,
                2 => VerifType::Float,
                _ => VerifType::Double,
            };
            pop_n(state, 2)?;
            state.stack.push(result);
        }
        // neg preserves the operand.
        0x74..=0x77 => {}
        // shifts pop the int count.
        op::ISHL..=0x7d => {
            let count = pop(state)?;
            let value = pop(state)?;
            debug_assert_eq!(count.width(), 1);
            state.stack.push(value);
        }
        op::IAND | op::IOR | op::IXOR => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Int);
        }
        0x7f | 0x81 | 0x83 => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Long);
        }
        op::I2L | 0x8c => {
            pop(state)?;
            state.stack.push(VerifType::Long);
        }
        op::I2F | 0x89 | 0x90 => {
            pop(state)?;
            state.stack.push(VerifType::Float);
        }
        op::I2D | 0x8d | 0x8a => {
            pop(state)?;
            state.stack.push(VerifType::Double);
        }
        op::L2I | op::F2I | op::D2I | op::I2B | op::I2C | op::I2S => {
            pop(state)?;
            state.stack.push(VerifType::Int);
        }
        0x8f => {
            pop(state)?;
            state.stack.push(VerifType::Long);
        }
        op::LCMP | op::FCMPL..=op::DCMPG => {
            pop_n(state, 2)?;
            state.stack.push(VerifType::Int);
        }
        op::IRETURN..=op::RETURN => return Ok(Flow::End),
        op::ARRAYLENGTH => {
            pop(state)?;
            state.stack.push(VerifType::Int);
        }
        op::ATHROW => {
            pop(state)?;
            return Ok(Flow::End);
        }
        op::MONITORENTER | op::MONITOREXIT => {
            pop(state)?;
        }
        other => bail!("unhandled opcode 0x{other:02x} in frame computation"),
    }
    Ok(Flow::Next)
}

/// Duplicate the top `dup` slots and reinsert them `skip` slots further
/// down, expressed over the value-based stack.
fn dup_slots(state: &mut State, dup: u32, skip: u32) -> Result<()> {
    let mut taken = Vec::new();
    let mut slots = 0;
    while slots < dup {
        let value = pop(state)?;
        slots += value.width();
        taken.push(value);
    }
    if slots != dup {
        bail!("dup across a wide value");
    }
    let mut skipped = Vec::new();
    let mut slots = 0;
    while slots < skip {
        let value = pop(state)?;
        slots += value.width();
        skipped.push(value);
    }
    // bottom copy, then the skipped run, then the original top values
    for value in taken.iter().rev() {
        state.stack.push(value.clone());
    }
    for value in skipped.iter().rev() {
        state.stack.push(value.clone());
    }
    for value in taken.iter().rev() {
        state.stack.push(value.clone());
    }
    Ok(())
}
