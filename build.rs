//! Generates the number -> mnemonic syscall tables from the host's kernel
//! headers. Missing headers produce empty tables, which only degrades the
//! diagnostic messages.

use std::env;
use std::fs;
use std::path::PathBuf;

const UNISTD_32: &[&str] = &[
  "/usr/include/x86_64-linux-gnu/asm/unistd_32.h",
  "/usr/include/i386-linux-gnu/asm/unistd_32.h",
  "/usr/include/asm/unistd_32.h",
];

const UNISTD_64: &[&str] = &[
  "/usr/include/x86_64-linux-gnu/asm/unistd_64.h",
  "/usr/include/asm/unistd_64.h",
];

const MAX_SYSCALL: usize = 1024;

fn parse_table(candidates: &[&str]) -> Vec<String> {
  let mut names: Vec<String> = vec![];
  for path in candidates {
    let Ok(contents) = fs::read_to_string(path) else {
      continue;
    };
    println!("cargo:rerun-if-changed={}", path);
    for line in contents.lines() {
      let Some(rest) = line.trim().strip_prefix("#define __NR_") else {
        continue;
      };
      let mut parts = rest.split_whitespace();
      let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
        continue;
      };
      // Skip aliases like `(__NR_foo + 1)`, keep plain numeric defines
      let Ok(nr) = value.parse::<usize>() else {
        continue;
      };
      if nr > MAX_SYSCALL {
        continue;
      }
      if names.len() <= nr {
        names.resize(nr + 1, String::new());
      }
      names[nr] = name.to_string();
    }
    break;
  }
  names
}

fn emit(out: &mut String, ident: &str, names: &[String]) {
  out.push_str(&format!(
    "pub(crate) static {}: &[&str] = &[\n",
    ident
  ));
  for name in names {
    out.push_str(&format!("  {:?},\n", name));
  }
  out.push_str("];\n");
}

fn main() {
  println!("cargo:rerun-if-changed=build.rs");

  let mut out = String::new();
  emit(&mut out, "SYSCALL_NAMES_I386", &parse_table(UNISTD_32));
  emit(&mut out, "SYSCALL_NAMES_X86_64", &parse_table(UNISTD_64));

  let dest = PathBuf::from(env::var("OUT_DIR").unwrap()).join("syscall_names.rs");
  fs::write(dest, out).unwrap();
}
