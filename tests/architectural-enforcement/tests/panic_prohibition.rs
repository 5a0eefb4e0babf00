//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code returns errors. `.unwrap()` and `.expect(`
//! belong in tests only. Test modules are expected at the end of each file.

use std::fs;

use architectural_enforcement::{production_lines, rust_files, workspace_root};

#[test]
fn test_no_unwrap_in_production_code() {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in ["udsock/core/src", "udsock/daemon/src"] {
        for path in rust_files(dir) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (line_number, line) in production_lines(&content) {
                let code = line.split("//").next().unwrap_or(line);
                if code.contains(".unwrap()") || code.contains(".expect(") {
                    violations.push(format!(
                        "{}:{} - {}",
                        path.strip_prefix(&root).unwrap_or(&path).display(),
                        line_number,
                        line.trim()
                    ));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ unwrap/expect in production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Propagate with `?` or map into TransportError / anyhow context");
        panic!("Found {} panic violation(s)", violations.len());
    }
}
