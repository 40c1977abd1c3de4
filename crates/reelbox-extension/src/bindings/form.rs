//! `FormData`: `multipart/form-data` bodies for `fetch`.
//!
//! Only text fields are supported, matching what scripts can put in a
//! `FormData` entry.

use serde::Serialize;

/// Random bytes in a boundary; hex encoded they give 60 characters.
const BOUNDARY_BYTES: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartBody {
    pub content_type: String,
    pub body: String,
}

fn random_boundary() -> String {
    let bytes: [u8; BOUNDARY_BYTES] = rand::random();
    data_encoding::HEXLOWER.encode(&bytes)
}

fn escape_quotes(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Encode `fields` in order, with a fresh random boundary.
pub fn encode(fields: &[(String, String)]) -> MultipartBody {
    encode_with_boundary(fields, &random_boundary())
}

fn encode_with_boundary(fields: &[(String, String)], boundary: &str) -> MultipartBody {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str("--");
        body.push_str(boundary);
        body.push_str("\r\n");
        body.push_str(&format!(
            "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
            escape_quotes(name)
        ));
        body.push_str(value);
        body.push_str("\r\n");
    }
    body.push_str("--");
    body.push_str(boundary);
    body.push_str("--\r\n");

    MultipartBody {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        body,
    }
}
