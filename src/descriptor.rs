use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Count parameters in a JVM method descriptor.
pub fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}

/// Return kind of a JVM method descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReturnKind {
    Void,
    Primitive,
    Reference,
}

/// Determine the return kind from a JVM method descriptor.
pub fn method_return_kind(descriptor: &str) -> Result<ReturnKind> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let kind = match descriptor.return_type() {
        TypeDescriptor::Void => ReturnKind::Void,
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => ReturnKind::Reference,
        _ => ReturnKind::Primitive,
    };
    Ok(kind)
}

/// Number of local-variable slots the parameter list occupies, excluding
/// the receiver. `long` and `double` occupy two slots.
pub fn parameter_slots(descriptor: &str) -> Result<u16> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let mut slots = 0u16;
    for parameter in descriptor.parameter_types() {
        slots += type_slot_width(parameter);
    }
    Ok(slots)
}

/// Slot width of a parsed type: two for `long`/`double`, one otherwise.
pub fn type_slot_width(descriptor: &TypeDescriptor) -> u16 {
    if matches!(descriptor, TypeDescriptor::Long | TypeDescriptor::Double) {
        2
    } else {
        1
    }
}

/// Slot width of a raw field descriptor.
pub fn slot_width(descriptor: &str) -> u16 {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// The raw return descriptor, i.e. everything after `)`.
pub fn return_descriptor(descriptor: &str) -> &str {
    match descriptor.rsplit_once(')') {
        Some((_, ret)) => ret,
        None => descriptor,
    }
}

/// Split the parameter list of a method descriptor into raw field
/// descriptors, in declaration order.
pub fn parameter_descriptors(descriptor: &str) -> Result<Vec<String>> {
    let inner = descriptor
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(params, _)| params)
        .with_context(|| format!("malformed method descriptor `{descriptor}`"))?;
    let mut parameters = Vec::new();
    let bytes = inner.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        let start = index;
        while bytes[index] == b'[' {
            index += 1;
            if index >= bytes.len() {
                anyhow::bail!("malformed method descriptor `{descriptor}`");
            }
        }
        match bytes[index] {
            b'L' => {
                while index < bytes.len() && bytes[index] != b';' {
                    index += 1;
                }
                if index >= bytes.len() {
                    anyhow::bail!("malformed method descriptor `{descriptor}`");
                }
                index += 1;
            }
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => index += 1,
            other => anyhow::bail!(
                "unexpected character `{}` in method descriptor `{descriptor}`",
                other as char
            ),
        }
        parameters.push(inner[start..index].to_string());
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_parameters_and_classifies_returns() {
        assert_eq!(method_param_count("(Ljava/lang/String;IJ)V").unwrap(), 3);
        assert_eq!(method_return_kind("()V").unwrap(), ReturnKind::Void);
        assert_eq!(method_return_kind("()I").unwrap(), ReturnKind::Primitive);
        assert_eq!(
            method_return_kind("()[Ljava/lang/String;").unwrap(),
            ReturnKind::Reference
        );
    }

    #[test]
    fn parameter_slots_count_wide_types_twice() {
        assert_eq!(parameter_slots("(IJD)V").unwrap(), 5);
        assert_eq!(parameter_slots("()V").unwrap(), 0);
        assert_eq!(parameter_slots("([J)V").unwrap(), 1);
    }

    #[test]
    fn splits_parameter_descriptors() {
        assert_eq!(
            parameter_descriptors("(I[JLjava/lang/String;[[Lx/Y;)V").unwrap(),
            vec!["I", "[J", "Ljava/lang/String;", "[[Lx/Y;"]
        );
        assert!(parameter_descriptors("(Ljava/lang/String").is_err());
    }

    #[test]
    fn return_descriptor_is_tail_after_paren() {
        assert_eq!(return_descriptor("(II)Ljava/lang/String;"), "Ljava/lang/String;");
        assert_eq!(return_descriptor("()V"), "V");
    }
}
