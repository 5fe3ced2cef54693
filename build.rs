fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/filesystem.capnp")
        .run()
        .expect("compiling schema/filesystem.capnp");
}
