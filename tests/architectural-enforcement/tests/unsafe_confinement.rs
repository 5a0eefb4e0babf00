//! Integration Test: Unsafe Confinement
//!
//! **Policy**: `unsafe` blocks are allowed only where the crate talks to libc
//! directly: `udsock/core/src/sys.rs` and `udsock/core/src/ancillary.rs`.
//! Everything else builds on the safe wrappers those two files export.

use std::fs;

use architectural_enforcement::{rust_files, workspace_root};

const ALLOWED: &[&str] = &["udsock/core/src/sys.rs", "udsock/core/src/ancillary.rs"];

#[test]
fn test_unsafe_only_in_syscall_layer() {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in ["udsock/core/src", "udsock/daemon/src"] {
        for path in rust_files(dir) {
            let relative = path.strip_prefix(&root).unwrap_or(&path);
            if ALLOWED.iter().any(|allowed| relative.ends_with(allowed)) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                let code = line.split("//").next().unwrap_or(line);
                if code.contains("unsafe ") || code.contains("unsafe{") {
                    violations.push(format!("{}:{} - {}", relative.display(), idx + 1, line.trim()));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ unsafe code outside the syscall layer:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        panic!("Found {} unsafe violation(s)", violations.len());
    }
}

#[test]
fn test_allowed_files_exist() {
    let root = workspace_root();
    for allowed in ALLOWED {
        assert!(root.join(allowed).exists(), "{allowed} moved; update ALLOWED");
    }
}
