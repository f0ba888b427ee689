//! Drives the binary over real files: a target class and an overwrite
//! mixin written to disk, woven into an output directory.

use std::fs;
use std::process::Command;

use classweave::classfile::{self, NoResolver};
use classweave::directive::api_descriptor;
use classweave::opcodes::{ACC_PUBLIC, ACC_STATIC, ACC_SUPER, ARETURN};
use classweave::tree::{Annotation, AnnotationValue, ClassNode, Const, Insn, MethodNode};

fn classweave_binary() -> String {
    std::env::var("CARGO_BIN_EXE_classweave").expect("binary path from cargo")
}

fn target_class() -> Vec<u8> {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER, "com/example/Greeter");
    let mut method = MethodNode::new(ACC_PUBLIC | ACC_STATIC, "greet", "()Ljava/lang/String;");
    method.insns =
        vec![Insn::Ldc(Const::String("hello".to_string())), Insn::Simple(ARETURN)];
    class.methods.push(method);
    classfile::write(&class, &NoResolver).unwrap()
}

fn mixin_class() -> Vec<u8> {
    let mut class = ClassNode::new(ACC_PUBLIC | ACC_SUPER, "mixins/GreeterMixin");
    class.annotations.push(Annotation {
        descriptor: api_descriptor("AsmMixin"),
        visible: true,
        values: vec![(
            "targets".to_string(),
            AnnotationValue::Array(vec![AnnotationValue::Str("com.example.Greeter".to_string())]),
        )],
    });
    let mut handler = MethodNode::new(ACC_PUBLIC | ACC_STATIC, "greet", "()Ljava/lang/String;");
    handler.insns =
        vec![Insn::Ldc(Const::String("woven".to_string())), Insn::Simple(ARETURN)];
    handler.annotations.push(Annotation {
        descriptor: api_descriptor("Overwrite"),
        visible: true,
        values: Vec::new(),
    });
    class.methods.push(handler);
    classfile::write(&class, &NoResolver).unwrap()
}

#[test]
fn weaves_a_directory_and_emits_the_runtime() {
    let workspace = tempfile::tempdir().unwrap();
    let input_dir = workspace.path().join("classes");
    let mixin_dir = workspace.path().join("mixins");
    let output_dir = workspace.path().join("out");
    fs::create_dir_all(&input_dir).unwrap();
    fs::create_dir_all(&mixin_dir).unwrap();
    fs::write(input_dir.join("Greeter.class"), target_class()).unwrap();
    fs::write(mixin_dir.join("GreeterMixin.class"), mixin_class()).unwrap();

    let output = Command::new(classweave_binary())
        .arg("--input")
        .arg(&input_dir)
        .arg("--mixin")
        .arg(&mixin_dir)
        .arg("--output")
        .arg(&output_dir)
        .arg("--quiet")
        .output()
        .expect("run classweave");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let woven_path = output_dir.join("com/example/Greeter.class");
    let woven = classfile::parse(&fs::read(&woven_path).unwrap()).unwrap();
    let method = woven.method("greet", Some("()Ljava/lang/String;")).unwrap();
    assert!(method.insns.iter().any(|insn| matches!(
        insn,
        Insn::Ldc(Const::String(value)) if value == "woven"
    )));

    for runtime in ["CallbackInfo", "Dispatch", "Replacement"] {
        let path = output_dir.join(format!("classweave/runtime/{runtime}.class"));
        assert!(path.exists(), "missing runtime class {runtime}");
    }
}
