fn main() {
    if !(cfg!(target_os = "linux") && cfg!(target_arch = "x86_64")) {
        panic!(
            "{} only works on linux x86_64 (the bundled shim loader targets libdbgshim.so, an ELF shared object)",
            env!("CARGO_PKG_NAME")
        );
    }
}
