use std::process::Command;

fn classweave_binary() -> String {
    std::env::var("CARGO_BIN_EXE_classweave").unwrap_or_else(|_| {
        let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target");
        path.push("debug");
        path.push("classweave");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path.to_string_lossy().to_string()
    })
}

#[test]
fn classweave_exits_non_zero_on_missing_inputs() {
    let output = Command::new(classweave_binary())
        .arg("--input")
        .arg("missing.class")
        .arg("--mixin")
        .arg("missing-mixins")
        .arg("--output")
        .arg("out")
        .output()
        .expect("run classweave");

    assert!(!output.status.success());
}

#[test]
fn classweave_requires_the_mixin_argument() {
    let output = Command::new(classweave_binary())
        .arg("--input")
        .arg("missing.class")
        .arg("--output")
        .arg("out")
        .output()
        .expect("run classweave");

    assert!(!output.status.success());
}
