use tonic_prost_build::Config;

fn main() {
    println!("cargo:rerun-if-changed=api");

    let protoc_path = protoc_bin_vendored::protoc_bin_path().unwrap();
    let mut config = Config::new();
    config.protoc_executable(protoc_path);
    tonic_prost_build::configure()
        .compile_with_config(config, &["api/kms/v1/kms.proto"], &["api"])
        .unwrap();
}
