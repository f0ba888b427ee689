//! RemoveMethod and RemoveSynchronized: coarse structural strips.

use anyhow::{Result, bail};

use crate::directive::MethodKey;
use crate::opcodes;
use crate::tree::{ClassNode, Insn};

/// Drop the named method from the class.
pub fn remove_method(class: &mut ClassNode, key: &MethodKey) -> Result<()> {
    let before = class.methods.len();
    class.methods.retain(|method| !key.matches(method));
    if class.methods.len() == before {
        bail!("RemoveMethod target {key} missing on {}", class.name);
    }
    Ok(())
}

/// Replace every `monitorenter` with `pop` and clear `ACC_SYNCHRONIZED`.
/// `monitorexit` is deliberately left alone; bodies that were
/// hand-synchronized rather than method-level-synchronized may fail
/// verification downstream.
pub fn remove_synchronized(class: &mut ClassNode, key: &MethodKey) -> Result<()> {
    let index = class
        .methods
        .iter()
        .position(|method| key.matches(method));
    let Some(index) = index else {
        bail!("RemoveSynchronized target {key} missing on {}", class.name);
    };
    strip_synchronization(&mut class.methods[index].insns);
    class.methods[index].access &= !opcodes::ACC_SYNCHRONIZED;
    Ok(())
}

pub(crate) fn strip_synchronization(insns: &mut [Insn]) {
    for insn in insns.iter_mut() {
        if matches!(insn, Insn::Simple(opcodes::MONITORENTER)) {
            *insn = Insn::Simple(opcodes::POP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ACC_PUBLIC, ACC_SYNCHRONIZED, MONITORENTER, MONITOREXIT, POP, RETURN};
    use crate::test_harness::target_with_method;

    fn key(name: &str) -> MethodKey {
        MethodKey { name: name.to_string(), descriptor: None }
    }

    #[test]
    fn remove_method_drops_the_member() {
        let mut class =
            target_with_method("t/T", "doomed", "()V", vec![Insn::Simple(RETURN)]);
        remove_method(&mut class, &key("doomed")).unwrap();
        assert!(class.methods.is_empty());
        assert!(remove_method(&mut class, &key("doomed")).is_err());
    }

    #[test]
    fn remove_synchronized_strips_the_flag_and_monitorenter_only() {
        let mut class = target_with_method(
            "t/T",
            "locked",
            "()V",
            vec![
                Insn::Var { opcode: crate::opcodes::ALOAD, var: 0 },
                Insn::Simple(MONITORENTER),
                Insn::Var { opcode: crate::opcodes::ALOAD, var: 0 },
                Insn::Simple(MONITOREXIT),
                Insn::Simple(RETURN),
            ],
        );
        class.methods[0].access = ACC_PUBLIC | ACC_SYNCHRONIZED;
        remove_synchronized(&mut class, &key("locked")).unwrap();
        let method = &class.methods[0];
        assert_eq!(method.access & ACC_SYNCHRONIZED, 0);
        assert!(matches!(method.insns[1], Insn::Simple(POP)));
        // monitorexit is not rebalanced.
        assert!(matches!(method.insns[3], Insn::Simple(MONITOREXIT)));
    }
}
