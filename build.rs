use std::process::Command;

const SCHEMA_FILE: &str = "schema/rpc.capnp";

fn has_capnp_binary() -> bool {
    Command::new("capnp")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn main() {
    println!("cargo:rerun-if-changed={SCHEMA_FILE}");

    if !has_capnp_binary() {
        panic!(
            "the `capnp` executable was not found in PATH; install Cap'n Proto \
             (https://capnproto.org/install.html) to compile {SCHEMA_FILE}"
        );
    }

    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file(SCHEMA_FILE)
        .run()
        .unwrap_or_else(|err| panic!("compiling {SCHEMA_FILE}: {err}"));
}
