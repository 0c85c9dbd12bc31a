fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc when none is installed.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::compile_protos("proto/batchd.proto")?;
    println!("cargo:rerun-if-changed=proto/batchd.proto");
    Ok(())
}
