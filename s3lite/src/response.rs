//! Interpreting what came back from the server.
//!
//! A 2xx response becomes an [`S3Response`].  Anything else becomes an [`S3Error`], preferably
//! a [`S3Error::Service`] built from the `<Error>` document S3 puts in the body, so the caller
//! sees the same code, message and request ID the server reported.
use crate::{dispatch::HttpResponse, Result, S3Error};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, StatusCode};
use quick_xml::{events::Event, Reader};
use tracing::debug;

/// Header S3 uses for the request ID
pub const AMZ_REQUEST_ID_HEADER: &str = "x-amz-request-id";

/// Some S3-compatible services use the generic AWS header instead
pub const AMZN_REQUEST_ID_HEADER: &str = "x-amzn-requestid";

/// A successful response
#[derive(Clone, Debug)]
pub struct S3Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    retries: u32,
}

impl S3Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// How many times the request was retried before this response was received
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The `ETag` header, quotes included
    pub fn etag(&self) -> Option<&str> {
        self.header(header::ETAG.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.header(header::LAST_MODIFIED.as_str())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|date| date.with_timezone(&Utc))
    }

    pub fn request_id(&self) -> Option<&str> {
        request_id_header(&self.headers)
    }

    pub(crate) fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Turn a raw HTTP response into either a successful [`S3Response`] or the error it describes
pub fn interpret(response: HttpResponse) -> Result<S3Response> {
    let HttpResponse {
        status,
        headers,
        body,
    } = response;

    if status.is_success() {
        return Ok(S3Response {
            status,
            headers,
            body,
            retries: 0,
        });
    }

    let header_request_id = request_id_header(&headers).map(str::to_string);

    let err = if body.iter().all(u8::is_ascii_whitespace) {
        // HEAD responses, and some proxies, don't send a body with the error
        let reason = status.canonical_reason().unwrap_or("Unknown");

        S3Error::Service {
            status,
            code: reason.replace([' ', '-'], ""),
            message: reason.to_string(),
            request_id: header_request_id,
            resource: None,
        }
    } else {
        match parse_error_document(&body) {
            Some(document) => S3Error::Service {
                status,
                code: document.code,
                message: document.message.unwrap_or_default(),
                request_id: document.request_id.or(header_request_id),
                resource: document.resource,
            },
            None => S3Error::UnparseableErrorResponse {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            },
        }
    };

    debug!(%status, err = %err, "S3 request failed");

    Err(err)
}

/// Extract the bucket names from a `ListAllMyBucketsResult` document
pub fn parse_bucket_names(body: &[u8]) -> Result<Vec<String>> {
    let elements = leaf_elements(body, "ListAllMyBucketsResult").ok_or_else(|| {
        S3Error::MalformedResponse {
            message: format!(
                "expected a ListAllMyBucketsResult document, got: {}",
                String::from_utf8_lossy(body)
            ),
        }
    })?;

    Ok(elements
        .into_iter()
        .filter(|(path, _)| path == "ListAllMyBucketsResult/Buckets/Bucket/Name")
        .map(|(_, name)| name)
        .collect())
}

struct ErrorDocument {
    code: String,
    message: Option<String>,
    request_id: Option<String>,
    resource: Option<String>,
}

fn parse_error_document(body: &[u8]) -> Option<ErrorDocument> {
    let elements = leaf_elements(body, "Error")?;

    let find = |name: &str| {
        let path = format!("Error/{name}");
        elements
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, text)| text.clone())
    };

    Some(ErrorDocument {
        code: find("Code").filter(|code| !code.is_empty())?,
        message: find("Message"),
        request_id: find("RequestId"),
        resource: find("Resource"),
    })
}

/// Collect the text of every leaf element in document order, keyed by its `/`-separated path
/// from the root.
///
/// Returns `None` if the document is not well-formed or its root element isn't `root`.
fn leaf_elements(body: &[u8], root: &str) -> Option<Vec<(String, String)>> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut buf = Vec::new();
    // Open elements, and whether each has seen a child element yet
    let mut stack: Vec<(String, bool)> = Vec::new();
    let mut text: Option<String> = None;
    let mut elements = Vec::new();
    let mut seen_root = false;

    let path = |stack: &[(String, bool)], name: &str| {
        stack
            .iter()
            .map(|(name, _)| name.as_str())
            .chain(std::iter::once(name))
            .collect::<Vec<_>>()
            .join("/")
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match stack.last_mut() {
                    Some((_, has_children)) => *has_children = true,
                    None => {
                        if seen_root || name != root {
                            return None;
                        }
                        seen_root = true;
                    }
                }
                stack.push((name, false));
                text = None;
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let (_, has_children) = stack.last_mut()?;
                *has_children = true;
                elements.push((path(&stack, &name), String::new()));
            }
            Ok(Event::Text(e)) => {
                if stack.is_empty() {
                    // Stray text outside of any element means this isn't XML
                    return None;
                }
                text = Some(e.unescape().ok()?.into_owned());
            }
            Ok(Event::CData(e)) => {
                text = Some(String::from_utf8_lossy(&e.into_inner()).into_owned());
            }
            Ok(Event::End(_)) => {
                let (name, has_children) = stack.pop()?;
                let text = text.take();
                if !has_children {
                    elements.push((path(&stack, &name), text.unwrap_or_default()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
        buf.clear();
    }

    (seen_root && stack.is_empty()).then_some(elements)
}

fn request_id_header(headers: &HeaderMap) -> Option<&str> {
    [AMZ_REQUEST_ID_HEADER, AMZN_REQUEST_ID_HEADER]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
}
