//! S3 XML documents: response builders and request parsers.

use crate::{
    models::bucket::Bucket,
    services::{listing::ListObjectsResult, storage_service::StorageError},
};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::{events::Event, reader::Reader};

const S3_NS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn error_xml(code: &str, message: &str, resource: Option<&str>) -> String {
    let mut xml = format!(
        "{XML_DECL}<Error><Code>{}</Code><Message>{}</Message>",
        xml_escape(code),
        xml_escape(message)
    );
    if let Some(resource) = resource {
        xml.push_str(&format!("<Resource>{}</Resource>", xml_escape(resource)));
    }
    xml.push_str("</Error>");
    xml
}

pub fn list_buckets_xml(owner: &str, buckets: &[Bucket]) -> String {
    let mut xml = format!(r#"{XML_DECL}<ListAllMyBucketsResult xmlns="{S3_NS}">"#);
    xml.push_str(&format!(
        "<Owner><ID>{0}</ID><DisplayName>{0}</DisplayName></Owner><Buckets>",
        xml_escape(owner)
    ));
    for bucket in buckets {
        xml.push_str(&format!(
            "<Bucket><Name>{}</Name><CreationDate>{}</CreationDate></Bucket>",
            xml_escape(&bucket.name),
            timestamp(&bucket.created_at)
        ));
    }
    xml.push_str("</Buckets></ListAllMyBucketsResult>");
    xml
}

pub fn create_bucket_xml(bucket: &str) -> String {
    format!(
        r#"{XML_DECL}<CreateBucketResult xmlns="{S3_NS}"><Location>/{}</Location></CreateBucketResult>"#,
        xml_escape(bucket)
    )
}

/// Echo of the request parameters for a ListObjectsV2 response.
pub struct ListRequestEcho<'a> {
    pub bucket: &'a str,
    pub prefix: Option<&'a str>,
    pub delimiter: Option<&'a str>,
    pub continuation_token: Option<&'a str>,
    pub start_after: Option<&'a str>,
}

pub fn list_objects_v2_xml(echo: &ListRequestEcho<'_>, result: &ListObjectsResult) -> String {
    let mut xml = format!(r#"{XML_DECL}<ListBucketResult xmlns="{S3_NS}">"#);
    xml.push_str(&format!("<Name>{}</Name>", xml_escape(echo.bucket)));
    xml.push_str(&format!(
        "<Prefix>{}</Prefix>",
        xml_escape(echo.prefix.unwrap_or(""))
    ));
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", result.max_keys));
    xml.push_str(&format!("<KeyCount>{}</KeyCount>", result.key_count));
    if let Some(token) = echo.continuation_token {
        xml.push_str(&format!(
            "<ContinuationToken>{}</ContinuationToken>",
            xml_escape(token)
        ));
    }
    if let Some(sa) = echo.start_after {
        xml.push_str(&format!("<StartAfter>{}</StartAfter>", xml_escape(sa)));
    }
    if let Some(delim) = echo.delimiter {
        xml.push_str(&format!("<Delimiter>{}</Delimiter>", xml_escape(delim)));
    }
    xml.push_str(&format!("<IsTruncated>{}</IsTruncated>", result.is_truncated));
    if let Some(next) = &result.next_continuation_token {
        xml.push_str(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            xml_escape(next)
        ));
    }

    for obj in &result.objects {
        xml.push_str("<Contents>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&obj.key)));
        xml.push_str(&format!(
            "<LastModified>{}</LastModified>",
            timestamp(&obj.last_modified)
        ));
        xml.push_str(&format!("<ETag>&quot;{}&quot;</ETag>", xml_escape(&obj.etag)));
        xml.push_str(&format!("<Size>{}</Size>", obj.size_bytes));
        xml.push_str(&format!(
            "<StorageClass>{}</StorageClass>",
            xml_escape(&obj.storage_class)
        ));
        xml.push_str("</Contents>");
    }

    for prefix in &result.common_prefixes {
        xml.push_str("<CommonPrefixes><Prefix>");
        xml.push_str(&xml_escape(prefix));
        xml.push_str("</Prefix></CommonPrefixes>");
    }

    xml.push_str("</ListBucketResult>");
    xml
}

/// One `<Deleted>` or `<Error>` entry of a DeleteResult.
pub enum DeleteEntry<'a> {
    Deleted { key: &'a str },
    Failed { key: &'a str, code: &'a str, message: String },
}

/// In quiet mode only failures are reported.
pub fn delete_result_xml(entries: &[DeleteEntry<'_>], quiet: bool) -> String {
    let mut xml = format!(r#"{XML_DECL}<DeleteResult xmlns="{S3_NS}">"#);
    for entry in entries {
        match entry {
            DeleteEntry::Deleted { key } => {
                if !quiet {
                    xml.push_str(&format!("<Deleted><Key>{}</Key></Deleted>", xml_escape(key)));
                }
            }
            DeleteEntry::Failed { key, code, message } => {
                xml.push_str(&format!(
                    "<Error><Key>{}</Key><Code>{}</Code><Message>{}</Message></Error>",
                    xml_escape(key),
                    xml_escape(code),
                    xml_escape(message)
                ));
            }
        }
    }
    xml.push_str("</DeleteResult>");
    xml
}

/// Parsed `<Delete>` request body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    pub keys: Vec<String>,
    pub quiet: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MalformedXml(String);

impl From<quick_xml::Error> for MalformedXml {
    fn from(err: quick_xml::Error) -> Self {
        MalformedXml(err.to_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DeleteField {
    None,
    Key,
    Quiet,
}

/// Parse a DeleteObjects request body.
///
/// Keys are taken verbatim, whitespace included.
pub fn parse_delete_request(body: &[u8]) -> Result<DeleteRequest, MalformedXml> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut request = DeleteRequest::default();
    let mut saw_root = false;
    let mut in_object = false;
    let mut field = DeleteField::None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Delete" => saw_root = true,
                b"Object" if saw_root => in_object = true,
                b"Key" if in_object => {
                    field = DeleteField::Key;
                    text.clear();
                }
                b"Quiet" if saw_root && !in_object => {
                    field = DeleteField::Quiet;
                    text.clear();
                }
                _ => {}
            },
            Event::Text(e) if field != DeleteField::None => {
                let value = e.unescape()?;
                text.push_str(&value);
            }
            Event::CData(e) if field != DeleteField::None => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"Key" if field == DeleteField::Key => {
                    request.keys.push(std::mem::take(&mut text));
                    field = DeleteField::None;
                }
                b"Quiet" if field == DeleteField::Quiet => {
                    request.quiet = text.trim().eq_ignore_ascii_case("true");
                    field = DeleteField::None;
                }
                b"Object" => in_object = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(MalformedXml("missing <Delete> element".into()));
    }
    if request.keys.is_empty() {
        return Err(MalformedXml("no <Object> entries to delete".into()));
    }
    Ok(request)
}

/// Region from a CreateBucketConfiguration body, if one was sent.
pub fn parse_location_constraint(body: &[u8]) -> Result<Option<String>, MalformedXml> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut inside = false;
    let mut region = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"LocationConstraint" => inside = true,
            Event::Text(e) if inside => {
                let value = e.unescape()?.trim().to_string();
                if !value.is_empty() {
                    region = Some(value);
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"LocationConstraint" => inside = false,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(region)
}

/// S3 error code for a per-key failure in a batch delete.
pub fn delete_error_code(err: &StorageError) -> &'static str {
    match err {
        StorageError::InvalidObjectKey => "InvalidArgument",
        StorageError::ObjectNotFound { .. } => "NoSuchKey",
        _ => "InternalError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delete_request_with_quiet_and_escapes() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
            <Delete xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
              <Quiet>true</Quiet>
              <Object><Key>a &amp; b.txt</Key></Object>
              <Object><Key>dir/ spaced </Key><VersionId>ignored</VersionId></Object>
            </Delete>"#;
        let parsed = parse_delete_request(body).unwrap();
        assert!(parsed.quiet);
        assert_eq!(parsed.keys, vec!["a & b.txt", "dir/ spaced "]);
    }

    #[test]
    fn rejects_bodies_without_objects() {
        assert!(parse_delete_request(b"<Delete></Delete>").is_err());
        assert!(parse_delete_request(b"<Other><Object><Key>k</Key></Object></Other>").is_err());
        assert!(parse_delete_request(b"<Delete><Object><Key>k</Oops></Delete>").is_err());
    }

    #[test]
    fn location_constraint_is_optional() {
        assert_eq!(parse_location_constraint(b"").unwrap(), None);
        let body = br#"<CreateBucketConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
            <LocationConstraint>eu-west-1</LocationConstraint>
        </CreateBucketConfiguration>"#;
        assert_eq!(
            parse_location_constraint(body).unwrap().as_deref(),
            Some("eu-west-1")
        );
    }

    #[test]
    fn quiet_delete_result_reports_only_errors() {
        let entries = [
            DeleteEntry::Deleted { key: "gone" },
            DeleteEntry::Failed {
                key: "../bad",
                code: "InvalidArgument",
                message: "invalid object key".into(),
            },
        ];
        let loud = delete_result_xml(&entries, false);
        assert!(loud.contains("<Deleted><Key>gone</Key></Deleted>"));
        let quiet = delete_result_xml(&entries, true);
        assert!(!quiet.contains("<Deleted>"));
        assert!(quiet.contains("<Error><Key>../bad</Key><Code>InvalidArgument</Code>"));
    }

    #[test]
    fn error_document_escapes_fields() {
        let xml = error_xml("NoSuchKey", "key <x> missing", Some("/b/<x>"));
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Message>key &lt;x&gt; missing</Message>"));
        assert!(xml.contains("<Resource>/b/&lt;x&gt;</Resource>"));
    }
}
