//! Classfile bytes → class tree.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use anyhow::{Context, Result, bail};
use byteorder::{BigEndian, ReadBytesExt};

use crate::opcodes;
use crate::tree::{
    Annotation, AnnotationValue, BootstrapMethod, ClassNode, Const, FieldNode, FrameNode, Handle,
    Insn, LabelId, LocalVar, MethodNode, Parameter, TryCatch, VType,
};

const MAGIC: u32 = 0xcafe_babe;

/// Constant-pool entry as stored in the classfile.
#[derive(Clone, Debug)]
enum CpEntry {
    Utf8(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    Str(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
    /// Index 0 and the slot following a long/double.
    Unusable,
}

struct Pool {
    entries: Vec<CpEntry>,
}

impl Pool {
    fn get(&self, index: u16) -> Result<&CpEntry> {
        self.entries
            .get(index as usize)
            .with_context(|| format!("constant pool index {index} out of range"))
    }

    fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            CpEntry::Utf8(value) => Ok(value.clone()),
            other => bail!("expected Utf8 at index {index}, found {other:?}"),
        }
    }

    fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            CpEntry::Class(name_index) => self.utf8(*name_index),
            other => bail!("expected Class at index {index}, found {other:?}"),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            CpEntry::NameAndType(name_index, descriptor_index) => {
                Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?))
            }
            other => bail!("expected NameAndType at index {index}, found {other:?}"),
        }
    }

    fn member_ref(&self, index: u16) -> Result<(String, String, String, bool)> {
        let (class_index, nat_index, interface) = match self.get(index)? {
            CpEntry::FieldRef(class_index, nat_index) => (*class_index, *nat_index, false),
            CpEntry::MethodRef(class_index, nat_index) => (*class_index, *nat_index, false),
            CpEntry::InterfaceMethodRef(class_index, nat_index) => (*class_index, *nat_index, true),
            other => bail!("expected member reference at index {index}, found {other:?}"),
        };
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok((owner, name, descriptor, interface))
    }

    fn handle(&self, index: u16) -> Result<Handle> {
        match self.get(index)? {
            CpEntry::MethodHandle(kind, reference) => {
                let (owner, name, descriptor, interface) = self.member_ref(*reference)?;
                Ok(Handle { kind: *kind, owner, name, descriptor, interface })
            }
            other => bail!("expected MethodHandle at index {index}, found {other:?}"),
        }
    }

    fn loadable(&self, index: u16) -> Result<Const> {
        let value = match self.get(index)? {
            CpEntry::Int(value) => Const::Int(*value),
            CpEntry::Float(value) => Const::Float(*value),
            CpEntry::Long(value) => Const::Long(*value),
            CpEntry::Double(value) => Const::Double(*value),
            CpEntry::Str(utf8_index) => Const::String(self.utf8(*utf8_index)?),
            CpEntry::Class(name_index) => Const::Class(self.utf8(*name_index)?),
            CpEntry::MethodType(descriptor_index) => {
                Const::MethodType(self.utf8(*descriptor_index)?)
            }
            CpEntry::MethodHandle(..) => Const::MethodHandle(self.handle(index)?),
            other => bail!("constant pool entry {other:?} is not loadable"),
        };
        Ok(value)
    }
}

struct RawAttribute {
    name: String,
    data: Vec<u8>,
}

impl RawAttribute {
    /// The leading u16 payload of single-index attributes.
    fn index(&self) -> Result<u16> {
        if self.data.len() < 2 {
            bail!("truncated {} attribute", self.name);
        }
        Ok(u16::from_be_bytes([self.data[0], self.data[1]]))
    }
}

struct RawMember {
    access: u16,
    name: String,
    descriptor: String,
    attributes: Vec<RawAttribute>,
}

/// Minimal class header used by classpath-backed superclass resolution.
#[derive(Clone, Debug)]
pub struct ClassHeader {
    pub access: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

/// Parse only the header of a classfile: access flags, names, interfaces.
pub fn parse_header(bytes: &[u8]) -> Result<ClassHeader> {
    let mut reader = Cursor::new(bytes);
    let pool = read_prelude(&mut reader)?;
    let access = reader.read_u16::<BigEndian>()?;
    let this_class = reader.read_u16::<BigEndian>()?;
    let super_class = reader.read_u16::<BigEndian>()?;
    let name = pool.class_name(this_class).context("resolve class name")?;
    let super_name = if super_class == 0 {
        None
    } else {
        Some(pool.class_name(super_class).context("resolve super class name")?)
    };
    let interface_count = reader.read_u16::<BigEndian>()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        let index = reader.read_u16::<BigEndian>()?;
        interfaces.push(pool.class_name(index)?);
    }
    Ok(ClassHeader { access, name, super_name, interfaces })
}

/// Parse a classfile into a class tree, expanding stack-map frames.
pub fn parse(bytes: &[u8]) -> Result<ClassNode> {
    let mut reader = Cursor::new(bytes);
    let pool = read_prelude(&mut reader)?;
    let version = {
        // The prelude cursor already consumed minor/major; recover them.
        let minor = u16::from_be_bytes([bytes[4], bytes[5]]);
        let major = u16::from_be_bytes([bytes[6], bytes[7]]);
        (minor as u32) << 16 | major as u32
    };
    let access = reader.read_u16::<BigEndian>()?;
    let this_class = reader.read_u16::<BigEndian>()?;
    let super_class = reader.read_u16::<BigEndian>()?;
    let name = pool.class_name(this_class).context("resolve class name")?;
    let super_name = if super_class == 0 {
        None
    } else {
        Some(pool.class_name(super_class).context("resolve super class name")?)
    };

    let interface_count = reader.read_u16::<BigEndian>()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        let index = reader.read_u16::<BigEndian>()?;
        interfaces.push(pool.class_name(index)?);
    }

    let raw_fields = read_members(&mut reader, &pool).context("read fields")?;
    let raw_methods = read_members(&mut reader, &pool).context("read methods")?;
    let class_attributes = read_attributes(&mut reader, &pool).context("read class attributes")?;

    let mut source_file = None;
    let mut signature = None;
    let mut annotations = Vec::new();
    let mut bootstrap_methods = Vec::new();
    for attribute in &class_attributes {
        match attribute.name.as_str() {
            "SourceFile" => source_file = Some(pool.utf8(attribute.index()?)?),
            "Signature" => signature = Some(pool.utf8(attribute.index()?)?),
            "RuntimeVisibleAnnotations" => {
                annotations.extend(read_annotations(&attribute.data, &pool, true)?);
            }
            "RuntimeInvisibleAnnotations" => {
                annotations.extend(read_annotations(&attribute.data, &pool, false)?);
            }
            "BootstrapMethods" => {
                bootstrap_methods = read_bootstrap_methods(&attribute.data, &pool)?;
            }
            _ => {}
        }
    }

    let mut fields = Vec::with_capacity(raw_fields.len());
    for raw in raw_fields {
        fields.push(resolve_field(raw, &pool).context("resolve field")?);
    }
    let mut methods = Vec::with_capacity(raw_methods.len());
    for raw in raw_methods {
        let key = format!("{}{}", raw.name, raw.descriptor);
        methods.push(
            resolve_method(raw, &pool, &bootstrap_methods)
                .with_context(|| format!("resolve method {key}"))?,
        );
    }

    Ok(ClassNode {
        version,
        access,
        name,
        super_name,
        interfaces,
        source_file,
        signature,
        annotations,
        fields,
        methods,
    })
}

fn read_prelude(reader: &mut Cursor<&[u8]>) -> Result<Pool> {
    let magic = reader.read_u32::<BigEndian>().context("read magic")?;
    if magic != MAGIC {
        bail!("not a classfile: bad magic 0x{magic:08x}");
    }
    let _minor = reader.read_u16::<BigEndian>()?;
    let _major = reader.read_u16::<BigEndian>()?;
    read_pool(reader).context("read constant pool")
}

fn read_pool(reader: &mut Cursor<&[u8]>) -> Result<Pool> {
    let count = reader.read_u16::<BigEndian>()?;
    let mut entries = vec![CpEntry::Unusable];
    let mut index = 1;
    while index < count {
        let tag = reader.read_u8()?;
        let entry = match tag {
            1 => {
                let length = reader.read_u16::<BigEndian>()? as usize;
                let mut data = vec![0u8; length];
                std::io::Read::read_exact(reader, &mut data)?;
                CpEntry::Utf8(String::from_utf8_lossy(&data).into_owned())
            }
            3 => CpEntry::Int(reader.read_i32::<BigEndian>()?),
            4 => CpEntry::Float(reader.read_f32::<BigEndian>()?),
            5 => CpEntry::Long(reader.read_i64::<BigEndian>()?),
            6 => CpEntry::Double(reader.read_f64::<BigEndian>()?),
            7 => CpEntry::Class(reader.read_u16::<BigEndian>()?),
            8 => CpEntry::Str(reader.read_u16::<BigEndian>()?),
            9 => CpEntry::FieldRef(reader.read_u16::<BigEndian>()?, reader.read_u16::<BigEndian>()?),
            10 => {
                CpEntry::MethodRef(reader.read_u16::<BigEndian>()?, reader.read_u16::<BigEndian>()?)
            }
            11 => CpEntry::InterfaceMethodRef(
                reader.read_u16::<BigEndian>()?,
                reader.read_u16::<BigEndian>()?,
            ),
            12 => CpEntry::NameAndType(
                reader.read_u16::<BigEndian>()?,
                reader.read_u16::<BigEndian>()?,
            ),
            15 => CpEntry::MethodHandle(reader.read_u8()?, reader.read_u16::<BigEndian>()?),
            16 => CpEntry::MethodType(reader.read_u16::<BigEndian>()?),
            17 => CpEntry::Dynamic(reader.read_u16::<BigEndian>()?, reader.read_u16::<BigEndian>()?),
            18 => CpEntry::InvokeDynamic(
                reader.read_u16::<BigEndian>()?,
                reader.read_u16::<BigEndian>()?,
            ),
            19 => CpEntry::Module(reader.read_u16::<BigEndian>()?),
            20 => CpEntry::Package(reader.read_u16::<BigEndian>()?),
            other => bail!("unknown constant pool tag {other} at index {index}"),
        };
        let wide = matches!(entry, CpEntry::Long(_) | CpEntry::Double(_));
        entries.push(entry);
        index += 1;
        if wide {
            entries.push(CpEntry::Unusable);
            index += 1;
        }
    }
    Ok(Pool { entries })
}

fn read_members(reader: &mut Cursor<&[u8]>, pool: &Pool) -> Result<Vec<RawMember>> {
    let count = reader.read_u16::<BigEndian>()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access = reader.read_u16::<BigEndian>()?;
        let name = pool.utf8(reader.read_u16::<BigEndian>()?)?;
        let descriptor = pool.utf8(reader.read_u16::<BigEndian>()?)?;
        let attributes = read_attributes(reader, pool)?;
        members.push(RawMember { access, name, descriptor, attributes });
    }
    Ok(members)
}

fn read_attributes(reader: &mut Cursor<&[u8]>, pool: &Pool) -> Result<Vec<RawAttribute>> {
    let count = reader.read_u16::<BigEndian>()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = pool.utf8(reader.read_u16::<BigEndian>()?)?;
        let length = reader.read_u32::<BigEndian>()? as usize;
        let mut data = vec![0u8; length];
        std::io::Read::read_exact(reader, &mut data)
            .with_context(|| format!("read attribute {name}"))?;
        attributes.push(RawAttribute { name, data });
    }
    Ok(attributes)
}

fn read_bootstrap_methods(data: &[u8], pool: &Pool) -> Result<Vec<BootstrapMethod>> {
    let mut reader = Cursor::new(data);
    let count = reader.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let handle = pool.handle(reader.read_u16::<BigEndian>()?)?;
        let arg_count = reader.read_u16::<BigEndian>()?;
        let mut args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            args.push(pool.loadable(reader.read_u16::<BigEndian>()?)?);
        }
        methods.push(BootstrapMethod { handle, args });
    }
    Ok(methods)
}

fn resolve_field(raw: RawMember, pool: &Pool) -> Result<FieldNode> {
    let mut field = FieldNode {
        access: raw.access,
        name: raw.name,
        descriptor: raw.descriptor,
        signature: None,
        constant: None,
        annotations: Vec::new(),
    };
    for attribute in &raw.attributes {
        match attribute.name.as_str() {
            "ConstantValue" => field.constant = Some(pool.loadable(attribute.index()?)?),
            "Signature" => field.signature = Some(pool.utf8(attribute.index()?)?),
            "RuntimeVisibleAnnotations" => {
                field.annotations.extend(read_annotations(&attribute.data, pool, true)?);
            }
            "RuntimeInvisibleAnnotations" => {
                field.annotations.extend(read_annotations(&attribute.data, pool, false)?);
            }
            _ => {}
        }
    }
    Ok(field)
}

fn resolve_method(
    raw: RawMember,
    pool: &Pool,
    bootstrap_methods: &[BootstrapMethod],
) -> Result<MethodNode> {
    let mut method = MethodNode::new(raw.access, raw.name, raw.descriptor);
    for attribute in &raw.attributes {
        match attribute.name.as_str() {
            "Code" => read_code(&attribute.data, pool, bootstrap_methods, &mut method)
                .context("decode Code attribute")?,
            "Exceptions" => {
                let mut reader = Cursor::new(attribute.data.as_slice());
                let count = reader.read_u16::<BigEndian>()?;
                for _ in 0..count {
                    method.exceptions.push(pool.class_name(reader.read_u16::<BigEndian>()?)?);
                }
            }
            "Signature" => method.signature = Some(pool.utf8(attribute.index()?)?),
            "MethodParameters" => {
                let mut reader = Cursor::new(attribute.data.as_slice());
                let count = reader.read_u8()?;
                for _ in 0..count {
                    let name_index = reader.read_u16::<BigEndian>()?;
                    let access = reader.read_u16::<BigEndian>()?;
                    let name =
                        if name_index == 0 { None } else { Some(pool.utf8(name_index)?) };
                    method.parameters.push(Parameter { name, access });
                }
            }
            "RuntimeVisibleAnnotations" => {
                method.annotations.extend(read_annotations(&attribute.data, pool, true)?);
            }
            "RuntimeInvisibleAnnotations" => {
                method.annotations.extend(read_annotations(&attribute.data, pool, false)?);
            }
            _ => {}
        }
    }
    Ok(method)
}

fn read_annotations(data: &[u8], pool: &Pool, visible: bool) -> Result<Vec<Annotation>> {
    let mut reader = Cursor::new(data);
    let count = reader.read_u16::<BigEndian>()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(read_annotation(&mut reader, pool, visible)?);
    }
    Ok(annotations)
}

fn read_annotation(reader: &mut Cursor<&[u8]>, pool: &Pool, visible: bool) -> Result<Annotation> {
    let descriptor = pool.utf8(reader.read_u16::<BigEndian>()?)?;
    let pair_count = reader.read_u16::<BigEndian>()?;
    let mut values = Vec::with_capacity(pair_count as usize);
    for _ in 0..pair_count {
        let name = pool.utf8(reader.read_u16::<BigEndian>()?)?;
        let value = read_element_value(reader, pool, visible)?;
        values.push((name, value));
    }
    Ok(Annotation { descriptor, visible, values })
}

fn read_element_value(
    reader: &mut Cursor<&[u8]>,
    pool: &Pool,
    visible: bool,
) -> Result<AnnotationValue> {
    let tag = reader.read_u8()?;
    let value = match tag {
        b'B' | b'C' | b'I' | b'S' | b'Z' => {
            let index = reader.read_u16::<BigEndian>()?;
            let constant = match pool.get(index)? {
                CpEntry::Int(value) => *value,
                other => bail!("expected Int for element value, found {other:?}"),
            };
            match tag {
                b'B' => AnnotationValue::Byte(constant as i8),
                b'C' => AnnotationValue::Char(constant as u16),
                b'S' => AnnotationValue::Short(constant as i16),
                b'Z' => AnnotationValue::Boolean(constant != 0),
                _ => AnnotationValue::Int(constant),
            }
        }
        b'D' => match pool.get(reader.read_u16::<BigEndian>()?)? {
            CpEntry::Double(value) => AnnotationValue::Double(*value),
            other => bail!("expected Double for element value, found {other:?}"),
        },
        b'F' => match pool.get(reader.read_u16::<BigEndian>()?)? {
            CpEntry::Float(value) => AnnotationValue::Float(*value),
            other => bail!("expected Float for element value, found {other:?}"),
        },
        b'J' => match pool.get(reader.read_u16::<BigEndian>()?)? {
            CpEntry::Long(value) => AnnotationValue::Long(*value),
            other => bail!("expected Long for element value, found {other:?}"),
        },
        b's' => AnnotationValue::Str(pool.utf8(reader.read_u16::<BigEndian>()?)?),
        b'e' => {
            let descriptor = pool.utf8(reader.read_u16::<BigEndian>()?)?;
            let value = pool.utf8(reader.read_u16::<BigEndian>()?)?;
            AnnotationValue::Enum { descriptor, value }
        }
        b'c' => AnnotationValue::Class(pool.utf8(reader.read_u16::<BigEndian>()?)?),
        b'@' => AnnotationValue::Annotation(Box::new(read_annotation(reader, pool, visible)?)),
        b'[' => {
            let count = reader.read_u16::<BigEndian>()?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(read_element_value(reader, pool, visible)?);
            }
            AnnotationValue::Array(values)
        }
        other => bail!("unknown element value tag {}", other as char),
    };
    Ok(value)
}

/// Mapping from bytecode offsets to label identities, built lazily.
struct LabelMap {
    labels: BTreeMap<u32, LabelId>,
    next: LabelId,
}

impl LabelMap {
    fn new() -> Self {
        Self { labels: BTreeMap::new(), next: 0 }
    }

    fn label_at(&mut self, offset: u32) -> LabelId {
        if let Some(label) = self.labels.get(&offset) {
            return *label;
        }
        let label = self.next;
        self.next += 1;
        self.labels.insert(offset, label);
        label
    }
}

fn read_code(
    data: &[u8],
    pool: &Pool,
    bootstrap_methods: &[BootstrapMethod],
    method: &mut MethodNode,
) -> Result<()> {
    let mut reader = Cursor::new(data);
    method.max_stack = reader.read_u16::<BigEndian>()?;
    method.max_locals = reader.read_u16::<BigEndian>()?;
    let code_length = reader.read_u32::<BigEndian>()? as usize;
    let code_start = reader.position() as usize;
    if code_start + code_length > data.len() {
        bail!("truncated Code attribute");
    }
    let code = &data[code_start..code_start + code_length];
    reader.set_position((code_start + code_length) as u64);

    let mut labels = LabelMap::new();

    let exception_count = reader.read_u16::<BigEndian>()?;
    let mut try_catch = Vec::with_capacity(exception_count as usize);
    for _ in 0..exception_count {
        let start_pc = reader.read_u16::<BigEndian>()? as u32;
        let end_pc = reader.read_u16::<BigEndian>()? as u32;
        let handler_pc = reader.read_u16::<BigEndian>()? as u32;
        let catch_index = reader.read_u16::<BigEndian>()?;
        let catch_type =
            if catch_index == 0 { None } else { Some(pool.class_name(catch_index)?) };
        try_catch.push(TryCatch {
            start: labels.label_at(start_pc),
            end: labels.label_at(end_pc),
            handler: labels.label_at(handler_pc),
            catch_type,
        });
    }
    method.try_catch = try_catch;

    // First pass: ensure a label exists at every branch target.
    scan_branch_targets(code, &mut labels).context("scan branch targets")?;

    // Code sub-attributes may reference offsets too.
    let attributes = read_attributes(&mut reader, pool)?;
    let mut line_numbers: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
    let mut local_vars = Vec::new();
    let mut raw_frames = None;
    for attribute in &attributes {
        match attribute.name.as_str() {
            "LineNumberTable" => {
                let mut table = Cursor::new(attribute.data.as_slice());
                let count = table.read_u16::<BigEndian>()?;
                for _ in 0..count {
                    let start_pc = table.read_u16::<BigEndian>()? as u32;
                    let line = table.read_u16::<BigEndian>()?;
                    labels.label_at(start_pc);
                    line_numbers.entry(start_pc).or_default().push(line);
                }
            }
            "LocalVariableTable" => {
                let mut table = Cursor::new(attribute.data.as_slice());
                let count = table.read_u16::<BigEndian>()?;
                for _ in 0..count {
                    let start_pc = table.read_u16::<BigEndian>()? as u32;
                    let length = table.read_u16::<BigEndian>()? as u32;
                    let name = pool.utf8(table.read_u16::<BigEndian>()?)?;
                    let descriptor = pool.utf8(table.read_u16::<BigEndian>()?)?;
                    let index = table.read_u16::<BigEndian>()?;
                    local_vars.push(LocalVar {
                        name,
                        descriptor,
                        signature: None,
                        start: labels.label_at(start_pc),
                        end: labels.label_at(start_pc + length),
                        index,
                    });
                }
            }
            "StackMapTable" => raw_frames = Some(attribute.data.clone()),
            _ => {}
        }
    }
    method.locals = local_vars;

    let frames = match raw_frames {
        Some(data) => expand_frames(&data, pool, method, &mut labels, code.len() as u32)
            .context("expand stack map table")?,
        None => HashMap::new(),
    };

    // Second pass: decode instructions, materializing labels, line numbers
    // and expanded frames in offset order.
    method.insns = decode_instructions(
        code,
        pool,
        bootstrap_methods,
        &mut labels,
        &line_numbers,
        &frames,
    )
    .context("decode instructions")?;
    method.next_label = labels.next;
    Ok(())
}

fn scan_branch_targets(code: &[u8], labels: &mut LabelMap) -> Result<()> {
    let mut offset = 0u32;
    while (offset as usize) < code.len() {
        let opcode = code[offset as usize];
        match opcode {
            opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
                let delta = i16::from_be_bytes(read_two(code, offset + 1)?) as i32;
                labels.label_at((offset as i32 + delta) as u32);
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let delta = i32::from_be_bytes(read_four(code, offset + 1)?);
                labels.label_at((offset as i32 + delta) as u32);
            }
            opcodes::TABLESWITCH => {
                let pad = 3 - (offset as usize % 4);
                let base = offset as usize + 1 + pad;
                let default = i32::from_be_bytes(read_four(code, base as u32)?);
                labels.label_at((offset as i32 + default) as u32);
                let low = i32::from_be_bytes(read_four(code, base as u32 + 4)?);
                let high = i32::from_be_bytes(read_four(code, base as u32 + 8)?);
                for entry in 0..(high - low + 1) {
                    let delta =
                        i32::from_be_bytes(read_four(code, base as u32 + 12 + 4 * entry as u32)?);
                    labels.label_at((offset as i32 + delta) as u32);
                }
            }
            opcodes::LOOKUPSWITCH => {
                let pad = 3 - (offset as usize % 4);
                let base = offset as usize + 1 + pad;
                let default = i32::from_be_bytes(read_four(code, base as u32)?);
                labels.label_at((offset as i32 + default) as u32);
                let pairs = i32::from_be_bytes(read_four(code, base as u32 + 4)?);
                for entry in 0..pairs {
                    let delta = i32::from_be_bytes(read_four(
                        code,
                        base as u32 + 8 + 8 * entry as u32 + 4,
                    )?);
                    labels.label_at((offset as i32 + delta) as u32);
                }
            }
            _ => {}
        }
        offset += instruction_size(code, offset)? as u32;
    }
    Ok(())
}

fn read_two(code: &[u8], offset: u32) -> Result<[u8; 2]> {
    let offset = offset as usize;
    if offset + 2 > code.len() {
        bail!("truncated instruction at offset {offset}");
    }
    Ok([code[offset], code[offset + 1]])
}

fn read_four(code: &[u8], offset: u32) -> Result<[u8; 4]> {
    let offset = offset as usize;
    if offset + 4 > code.len() {
        bail!("truncated instruction at offset {offset}");
    }
    Ok([code[offset], code[offset + 1], code[offset + 2], code[offset + 3]])
}

/// Size in bytes of the instruction at `offset`.
fn instruction_size(code: &[u8], offset: u32) -> Result<usize> {
    let opcode = code[offset as usize];
    let size = match opcode {
        opcodes::BIPUSH
        | opcodes::LDC
        | opcodes::ILOAD..=opcodes::ALOAD
        | opcodes::ISTORE..=opcodes::ASTORE
        | opcodes::RET
        | opcodes::NEWARRAY => 2,
        opcodes::SIPUSH
        | opcodes::LDC_W
        | opcodes::LDC2_W
        | opcodes::IINC
        | opcodes::IFEQ..=opcodes::JSR
        | opcodes::GETSTATIC..=opcodes::INVOKESTATIC
        | opcodes::NEW
        | opcodes::ANEWARRAY
        | opcodes::CHECKCAST
        | opcodes::INSTANCEOF
        | opcodes::IFNULL
        | opcodes::IFNONNULL => 3,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC | opcodes::GOTO_W | opcodes::JSR_W => 5,
        opcodes::WIDE => {
            if code[offset as usize + 1] == opcodes::IINC {
                6
            } else {
                4
            }
        }
        opcodes::TABLESWITCH => {
            let pad = 3 - (offset as usize % 4);
            let base = offset as usize + 1 + pad;
            let low = i32::from_be_bytes(read_four(code, base as u32 + 4)?);
            let high = i32::from_be_bytes(read_four(code, base as u32 + 8)?);
            1 + pad + 12 + 4 * (high - low + 1) as usize
        }
        opcodes::LOOKUPSWITCH => {
            let pad = 3 - (offset as usize % 4);
            let base = offset as usize + 1 + pad;
            let pairs = i32::from_be_bytes(read_four(code, base as u32 + 4)?);
            1 + pad + 8 + 8 * pairs as usize
        }
        _ => 1,
    };
    Ok(size)
}

fn decode_instructions(
    code: &[u8],
    pool: &Pool,
    bootstrap_methods: &[BootstrapMethod],
    labels: &mut LabelMap,
    line_numbers: &BTreeMap<u32, Vec<u16>>,
    frames: &HashMap<u32, FrameNode>,
) -> Result<Vec<Insn>> {
    let mut insns = Vec::new();
    let mut offset = 0u32;
    while (offset as usize) < code.len() {
        if let Some(label) = labels.labels.get(&offset) {
            insns.push(Insn::Label(*label));
        }
        if let Some(frame) = frames.get(&offset) {
            insns.push(Insn::Frame(frame.clone()));
        }
        if let Some(lines) = line_numbers.get(&offset) {
            let start = labels.label_at(offset);
            for line in lines {
                insns.push(Insn::LineNumber { line: *line, start });
            }
        }
        let opcode = code[offset as usize];
        let insn = decode_one(code, offset, opcode, pool, bootstrap_methods, labels)?;
        let size = instruction_size(code, offset)?;
        insns.push(insn);
        offset += size as u32;
    }
    // Labels at the very end of the code (try/catch and variable ranges).
    if let Some(label) = labels.labels.get(&offset) {
        insns.push(Insn::Label(*label));
    }
    Ok(insns)
}

fn decode_one(
    code: &[u8],
    offset: u32,
    opcode: u8,
    pool: &Pool,
    bootstrap_methods: &[BootstrapMethod],
    labels: &mut LabelMap,
) -> Result<Insn> {
    let at = offset as usize;
    let insn = match opcode {
        opcodes::BIPUSH => Insn::Int { opcode, operand: code[at + 1] as i8 as i32 },
        opcodes::SIPUSH => Insn::Int {
            opcode,
            operand: i16::from_be_bytes(read_two(code, offset + 1)?) as i32,
        },
        opcodes::NEWARRAY => Insn::Int { opcode, operand: code[at + 1] as i32 },
        opcodes::LDC => Insn::Ldc(pool.loadable(code[at + 1] as u16)?),
        opcodes::LDC_W | opcodes::LDC2_W => {
            Insn::Ldc(pool.loadable(u16::from_be_bytes(read_two(code, offset + 1)?))?)
        }
        opcodes::ILOAD..=opcodes::ALOAD | opcodes::ISTORE..=opcodes::ASTORE | opcodes::RET => {
            Insn::Var { opcode, var: code[at + 1] as u16 }
        }
        0x1a..=0x2d => {
            // iload_0 .. aload_3 compact forms
            let base = opcode - opcodes::ILOAD_0;
            Insn::Var {
                opcode: opcodes::ILOAD + base / 4,
                var: (base % 4) as u16,
            }
        }
        0x3b..=0x4e => {
            // istore_0 .. astore_3 compact forms
            let base = opcode - opcodes::ISTORE_0;
            Insn::Var {
                opcode: opcodes::ISTORE + base / 4,
                var: (base % 4) as u16,
            }
        }
        opcodes::IINC => Insn::Iinc {
            var: code[at + 1] as u16,
            delta: code[at + 2] as i8 as i16,
        },
        opcodes::WIDE => {
            let wide_opcode = code[at + 1];
            let var = u16::from_be_bytes(read_two(code, offset + 2)?);
            if wide_opcode == opcodes::IINC {
                let delta = i16::from_be_bytes(read_two(code, offset + 4)?);
                Insn::Iinc { var, delta }
            } else {
                Insn::Var { opcode: wide_opcode, var }
            }
        }
        opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
            let delta = i16::from_be_bytes(read_two(code, offset + 1)?) as i32;
            Insn::Jump {
                opcode,
                label: labels.label_at((offset as i32 + delta) as u32),
            }
        }
        opcodes::GOTO_W | opcodes::JSR_W => {
            let delta = i32::from_be_bytes(read_four(code, offset + 1)?);
            let narrow = if opcode == opcodes::GOTO_W { opcodes::GOTO } else { opcodes::JSR };
            Insn::Jump {
                opcode: narrow,
                label: labels.label_at((offset as i32 + delta) as u32),
            }
        }
        opcodes::TABLESWITCH => {
            let pad = 3 - (at % 4);
            let base = (at + 1 + pad) as u32;
            let default_delta = i32::from_be_bytes(read_four(code, base)?);
            let low = i32::from_be_bytes(read_four(code, base + 4)?);
            let high = i32::from_be_bytes(read_four(code, base + 8)?);
            let mut switch_labels = Vec::with_capacity((high - low + 1) as usize);
            for entry in 0..(high - low + 1) {
                let delta = i32::from_be_bytes(read_four(code, base + 12 + 4 * entry as u32)?);
                switch_labels.push(labels.label_at((offset as i32 + delta) as u32));
            }
            Insn::TableSwitch {
                low,
                high,
                default: labels.label_at((offset as i32 + default_delta) as u32),
                labels: switch_labels,
            }
        }
        opcodes::LOOKUPSWITCH => {
            let pad = 3 - (at % 4);
            let base = (at + 1 + pad) as u32;
            let default_delta = i32::from_be_bytes(read_four(code, base)?);
            let pair_count = i32::from_be_bytes(read_four(code, base + 4)?);
            let mut pairs = Vec::with_capacity(pair_count as usize);
            for entry in 0..pair_count {
                let key = i32::from_be_bytes(read_four(code, base + 8 + 8 * entry as u32)?);
                let delta = i32::from_be_bytes(read_four(code, base + 8 + 8 * entry as u32 + 4)?);
                pairs.push((key, labels.label_at((offset as i32 + delta) as u32)));
            }
            Insn::LookupSwitch {
                default: labels.label_at((offset as i32 + default_delta) as u32),
                pairs,
            }
        }
        opcodes::GETSTATIC..=opcodes::PUTFIELD => {
            let index = u16::from_be_bytes(read_two(code, offset + 1)?);
            let (owner, name, descriptor, _) = pool.member_ref(index)?;
            Insn::Field { opcode, owner, name, descriptor }
        }
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
            let index = u16::from_be_bytes(read_two(code, offset + 1)?);
            let (owner, name, descriptor, interface) = pool.member_ref(index)?;
            Insn::Method { opcode, owner, name, descriptor, interface }
        }
        opcodes::INVOKEDYNAMIC => {
            let index = u16::from_be_bytes(read_two(code, offset + 1)?);
            let (bsm_index, nat_index) = match pool.get(index)? {
                CpEntry::InvokeDynamic(bsm_index, nat_index) => (*bsm_index, *nat_index),
                other => bail!("expected InvokeDynamic at index {index}, found {other:?}"),
            };
            let (name, descriptor) = pool.name_and_type(nat_index)?;
            let bootstrap = bootstrap_methods
                .get(bsm_index as usize)
                .with_context(|| format!("bootstrap method index {bsm_index} out of range"))?
                .clone();
            Insn::InvokeDynamic { name, descriptor, bootstrap }
        }
        opcodes::NEW | opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => {
            let index = u16::from_be_bytes(read_two(code, offset + 1)?);
            Insn::Type { opcode, class_name: pool.class_name(index)? }
        }
        opcodes::MULTIANEWARRAY => {
            let index = u16::from_be_bytes(read_two(code, offset + 1)?);
            Insn::MultiANewArray {
                descriptor: pool.class_name(index)?,
                dims: code[at + 3],
            }
        }
        _ => Insn::Simple(opcode),
    };
    Ok(insn)
}

fn expand_frames(
    data: &[u8],
    pool: &Pool,
    method: &MethodNode,
    labels: &mut LabelMap,
    code_length: u32,
) -> Result<HashMap<u32, FrameNode>> {
    let mut reader = Cursor::new(data);
    let count = reader.read_u16::<BigEndian>()?;
    let mut frames = HashMap::new();

    let mut locals = initial_frame_locals(method);
    let mut offset: i64 = -1;
    for _ in 0..count {
        let frame_type = reader.read_u8()?;
        let (delta, next_locals, stack) = match frame_type {
            0..=63 => (frame_type as u16, locals.clone(), Vec::new()),
            64..=127 => {
                let item = read_verification_type(&mut reader, pool, labels)?;
                ((frame_type - 64) as u16, locals.clone(), vec![item])
            }
            247 => {
                let delta = reader.read_u16::<BigEndian>()?;
                let item = read_verification_type(&mut reader, pool, labels)?;
                (delta, locals.clone(), vec![item])
            }
            248..=250 => {
                let delta = reader.read_u16::<BigEndian>()?;
                let chop = (251 - frame_type) as usize;
                let mut next = locals.clone();
                let keep = next.len().saturating_sub(chop);
                next.truncate(keep);
                (delta, next, Vec::new())
            }
            251 => (reader.read_u16::<BigEndian>()?, locals.clone(), Vec::new()),
            252..=254 => {
                let delta = reader.read_u16::<BigEndian>()?;
                let mut next = locals.clone();
                for _ in 0..(frame_type - 251) {
                    next.push(read_verification_type(&mut reader, pool, labels)?);
                }
                (delta, next, Vec::new())
            }
            255 => {
                let delta = reader.read_u16::<BigEndian>()?;
                let local_count = reader.read_u16::<BigEndian>()?;
                let mut next = Vec::with_capacity(local_count as usize);
                for _ in 0..local_count {
                    next.push(read_verification_type(&mut reader, pool, labels)?);
                }
                let stack_count = reader.read_u16::<BigEndian>()?;
                let mut stack = Vec::with_capacity(stack_count as usize);
                for _ in 0..stack_count {
                    stack.push(read_verification_type(&mut reader, pool, labels)?);
                }
                (delta, next, stack)
            }
            other => bail!("unsupported stack map frame type {other}"),
        };
        offset += delta as i64 + 1;
        if offset < 0 || offset as u32 > code_length {
            bail!("stack map frame offset {offset} out of range");
        }
        locals = next_locals;
        labels.label_at(offset as u32);
        frames.insert(offset as u32, FrameNode { locals: locals.clone(), stack });
    }
    Ok(frames)
}

fn initial_frame_locals(method: &MethodNode) -> Vec<VType> {
    let mut locals = Vec::new();
    if !method.is_static() {
        if method.is_constructor() {
            locals.push(VType::UninitializedThis);
        } else {
            // The declaring class name is not known here; `Top` is safe
            // because the reader's expanded frames are informational only
            // (the writer recomputes them from scratch).
            locals.push(VType::Top);
        }
    }
    if let Ok(parameters) = crate::descriptor::parameter_descriptors(&method.descriptor) {
        for parameter in parameters {
            match parameter.as_bytes()[0] {
                b'I' | b'Z' | b'B' | b'C' | b'S' => locals.push(VType::Int),
                b'F' => locals.push(VType::Float),
                b'J' => locals.push(VType::Long),
                b'D' => locals.push(VType::Double),
                _ => locals.push(VType::Object(crate::bytecode::descriptor_to_internal(&parameter))),
            }
        }
    }
    locals
}

fn read_verification_type(
    reader: &mut Cursor<&[u8]>,
    pool: &Pool,
    labels: &mut LabelMap,
) -> Result<VType> {
    let tag = reader.read_u8()?;
    let vtype = match tag {
        0 => VType::Top,
        1 => VType::Int,
        2 => VType::Float,
        3 => VType::Double,
        4 => VType::Long,
        5 => VType::Null,
        6 => VType::UninitializedThis,
        7 => VType::Object(pool.class_name(reader.read_u16::<BigEndian>()?)?),
        8 => {
            let offset = reader.read_u16::<BigEndian>()? as u32;
            VType::Uninitialized(labels.label_at(offset))
        }
        other => bail!("unknown verification type tag {other}"),
    };
    Ok(vtype)
}
