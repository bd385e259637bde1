//! WebDAV multistatus bodies.
//!
//! The proxy reads backend PROPFIND replies with a streaming quick-xml reader
//! (only the handful of live properties it needs) and renders its own replies
//! with a fixed property set.

use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use thiserror::Error;

use crate::metadata::{Resource, ResourceMeta, parse_http_date, unquote_etag};
use crate::path;

/// Request body sent with every backend PROPFIND.
pub const PROPFIND_REQUEST: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8" ?>"#,
    r#"<D:propfind xmlns:D="DAV:"><D:allprop/></D:propfind>"#
);

/// Content type of multistatus replies.
pub const MULTISTATUS_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

/// The backend sent a body that is not a usable multistatus document.
#[derive(Debug, Error)]
#[error("invalid multistatus body: {0}")]
pub struct MultistatusError(String);

/// One `response` element of a multistatus body, href still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropfindEntry {
    pub href: String,
    pub meta: ResourceMeta,
}

#[derive(Debug, Default, Clone)]
struct Props {
    size: Option<u64>,
    modified: Option<String>,
    etag: Option<String>,
    content_type: Option<String>,
    is_collection: bool,
}

impl Props {
    fn merge(&mut self, other: Props) {
        self.size = other.size.or(self.size);
        self.modified = other.modified.or(self.modified.take());
        self.etag = other.etag.or(self.etag.take());
        self.content_type = other.content_type.or(self.content_type.take());
        self.is_collection |= other.is_collection;
    }

    fn into_meta(self) -> ResourceMeta {
        let modified = self.modified.as_deref().and_then(parse_http_date);
        if self.is_collection {
            let mut meta = ResourceMeta::collection(modified);
            meta.etag = self.etag;
            meta
        } else {
            let mut meta = ResourceMeta::file(self.size.unwrap_or(0), modified, self.etag);
            meta.content_type = self.content_type;
            meta
        }
    }
}

fn status_is_ok(status: &str) -> bool {
    status.split_whitespace().nth(1) == Some("200")
}

/// Parses a multistatus document, keeping the properties reported with a
/// 200 status and dropping responses whose own status is an error.
pub fn parse_multistatus(xml: &str) -> Result<Vec<PropfindEntry>, MultistatusError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut href: Option<String> = None;
    let mut response_ok = true;
    let mut accepted = Props::default();
    let mut current = Props::default();
    let mut propstat_ok: Option<bool> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| MultistatusError(e.to_string()))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "collection" && stack.iter().any(|n| n == "resourcetype") {
                    current.is_collection = true;
                }
                match name.as_str() {
                    "response" => {
                        href = None;
                        response_ok = true;
                        accepted = Props::default();
                    }
                    "propstat" => {
                        current = Props::default();
                        propstat_ok = None;
                    }
                    _ => {}
                }
                text.clear();
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = e.local_name();
                if name.as_ref() == b"collection"
                    && stack.last().is_some_and(|n| n == "resourcetype")
                {
                    current.is_collection = true;
                }
            }
            Event::Text(t) => {
                let unescaped = t.unescape().map_err(|e| MultistatusError(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::CData(c) => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Event::End(_) => {
                let Some(name) = stack.pop() else {
                    return Err(MultistatusError("unbalanced end tag".to_string()));
                };
                let in_propstat = stack.iter().any(|n| n == "propstat");
                let value = text.trim().to_string();
                text.clear();
                match name.as_str() {
                    "href" if !in_propstat => href = Some(value),
                    "status" if in_propstat => propstat_ok = Some(status_is_ok(&value)),
                    "status" => response_ok = status_is_ok(&value),
                    "getcontentlength" => current.size = value.parse().ok(),
                    "getlastmodified" => current.modified = Some(value),
                    "getetag" if !value.is_empty() => current.etag = Some(unquote_etag(&value)),
                    "getcontenttype" if !value.is_empty() => current.content_type = Some(value),
                    "propstat" => {
                        if propstat_ok.unwrap_or(true) {
                            accepted.merge(std::mem::take(&mut current));
                        }
                    }
                    "response" => {
                        if let Some(href) = href.take()
                            && response_ok
                        {
                            entries.push(PropfindEntry {
                                href,
                                meta: std::mem::take(&mut accepted).into_meta(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

/// Renders a multistatus reply for `resources`, with hrefs under
/// `mount_prefix`.
pub fn render_multistatus(mount_prefix: &str, resources: &[Resource]) -> String {
    let mut out = String::with_capacity(256 + resources.len() * 512);
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<D:multistatus xmlns:D=\"DAV:\">\n");
    for resource in resources {
        render_response(&mut out, mount_prefix, resource);
    }
    out.push_str("</D:multistatus>\n");
    out
}

fn render_response(out: &mut String, mount_prefix: &str, resource: &Resource) {
    let meta = &resource.meta;
    let mut href = format!("{mount_prefix}{}", path::encode(&resource.path));
    if meta.is_collection && !href.ends_with('/') {
        href.push('/');
    }
    let name = path::file_name(&resource.path);

    let _ = write!(
        out,
        "<D:response><D:href>{}</D:href><D:propstat><D:prop>",
        escape(&href)
    );
    let _ = write!(out, "<D:displayname>{}</D:displayname>", escape(name));
    if meta.is_collection {
        out.push_str("<D:resourcetype><D:collection/></D:resourcetype>");
    } else {
        out.push_str("<D:resourcetype/>");
        let _ = write!(out, "<D:getcontentlength>{}</D:getcontentlength>", meta.size);
        let content_type = meta
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let _ = write!(
            out,
            "<D:getcontenttype>{}</D:getcontenttype>",
            escape(content_type)
        );
    }
    if let Some(date) = meta.http_date() {
        let _ = write!(out, "<D:getlastmodified>{date}</D:getlastmodified>");
    }
    if let Some(etag) = meta.quoted_etag() {
        let _ = write!(out, "<D:getetag>{}</D:getetag>", escape(&etag));
    }
    out.push_str("</D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n");
}
