fn main() {
    // The legacy v2 service is generated from hand-written prost messages
    // in `src/lib.rs`, so no .proto sources are required.
    let check = tonic_build::manual::Method::builder()
        .name("check")
        .route_name("Check")
        .input_type("crate::v2::CheckRequest")
        .output_type("crate::v2::CheckResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let authorization = tonic_build::manual::Service::builder()
        .name("Authorization")
        .package("envoy.service.auth.v2")
        .method(check)
        .build();

    tonic_build::manual::Builder::new().compile(&[authorization]);

    println!("cargo:rerun-if-changed=build.rs");
}
