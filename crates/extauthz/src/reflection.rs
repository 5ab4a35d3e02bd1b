//! gRPC reflection for the authorization services
//!
//! Advertises `envoy.service.auth.v2.Authorization` and
//! `envoy.service.auth.v3.Authorization` so tools like `grpcurl` can list
//! them. Only service and message names are described.

use prost_types::{
    DescriptorProto, FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto,
    ServiceDescriptorProto,
};
use tonic_reflection::server::v1::{ServerReflection, ServerReflectionServer};

use crate::error::{ExtAuthzError, Result};

/// Fully qualified names of the advertised services
pub const SERVICE_NAMES: [&str; 2] = [
    "envoy.service.auth.v2.Authorization",
    "envoy.service.auth.v3.Authorization",
];

fn auth_file(version: &str) -> FileDescriptorProto {
    let package = format!("envoy.service.auth.{}", version);
    let message = |name: &str| DescriptorProto {
        name: Some(name.to_string()),
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some(format!("envoy/service/auth/{}/external_auth.proto", version)),
        package: Some(package.clone()),
        syntax: Some("proto3".to_string()),
        message_type: vec![message("CheckRequest"), message("CheckResponse")],
        service: vec![ServiceDescriptorProto {
            name: Some("Authorization".to_string()),
            method: vec![MethodDescriptorProto {
                name: Some("Check".to_string()),
                input_type: Some(format!(".{}.CheckRequest", package)),
                output_type: Some(format!(".{}.CheckResponse", package)),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Descriptor set covering both protocol versions
pub fn descriptor_set() -> FileDescriptorSet {
    FileDescriptorSet {
        file: vec![auth_file("v2"), auth_file("v3")],
    }
}

/// Build the `grpc.reflection.v1` service
pub fn reflection_service() -> Result<ServerReflectionServer<impl ServerReflection>> {
    tonic_reflection::server::Builder::configure()
        .register_file_descriptor_set(descriptor_set())
        .build_v1()
        .map_err(|e| ExtAuthzError::config(format!("failed to build reflection service: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_set_names_both_services() {
        let set = descriptor_set();
        let names: Vec<String> = set
            .file
            .iter()
            .flat_map(|f| {
                let package = f.package().to_string();
                f.service
                    .iter()
                    .map(move |s| format!("{}.{}", package, s.name()))
            })
            .collect();
        assert_eq!(names, SERVICE_NAMES);
    }

    #[test]
    fn test_reflection_service_builds() {
        assert!(reflection_service().is_ok());
    }
}
