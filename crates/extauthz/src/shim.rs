//! Downgrade of v3 check responses for v2 clients

use envoy_types::ext_authz::v3::pb::CheckResponse;
use envoy_types::pb::envoy::config::core::v3::HeaderValueOption;
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::auth::v3::check_response::HttpResponse;
use extauthz_proto::v2;

/// Map a v3 response onto the v2 wire shape
///
/// The ok branch keeps only `headers`; v2 has nowhere to carry headers to
/// remove, response headers or dynamic metadata.
pub fn v2_response(resp: CheckResponse) -> v2::CheckResponse {
    let http_response = resp.http_response.map(|http| match http {
        HttpResponse::OkResponse(ok) => {
            v2::check_response::HttpResponse::OkResponse(v2::OkHttpResponse {
                headers: v2_headers(ok.headers),
            })
        }
        HttpResponse::DeniedResponse(denied) => {
            v2::check_response::HttpResponse::DeniedResponse(v2::DeniedHttpResponse {
                status: denied.status.map(v2_status),
                headers: v2_headers(denied.headers),
                body: denied.body,
            })
        }
    });

    v2::CheckResponse {
        status: resp.status,
        http_response,
    }
}

fn v2_headers(headers: Vec<HeaderValueOption>) -> Vec<v2::HeaderValueOption> {
    headers
        .into_iter()
        .map(|option| {
            let header = option.header.unwrap_or_default();
            v2::HeaderValueOption {
                header: Some(v2::HeaderValue {
                    key: header.key,
                    value: header.value,
                }),
                append: None,
            }
        })
        .collect()
}

fn v2_status(status: HttpStatus) -> v2::HttpStatus {
    let code = v2::StatusCode::try_from(status.code).unwrap_or(v2::StatusCode::Empty);
    v2::HttpStatus { code: code as i32 }
}
