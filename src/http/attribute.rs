//! Header value templates resolved per exchange.
//!
//! Templates are plain text with `%{name}` placeholders:
//! `%{remote_addr}`, `%{remote_ip}`, `%{request_id}`, `%{host}`, `%{method}`,
//! `%{path}`, `%{scheme}`. Unknown placeholders are kept verbatim.

use std::net::SocketAddr;

/// What an attribute can be resolved against.
#[derive(Debug, Clone, Copy)]
pub struct AttributeContext<'a> {
    pub remote_addr: SocketAddr,
    pub request_id: Option<&'a str>,
    pub host: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
    pub scheme: &'a str,
}

/// Produces a header value for one exchange.
pub trait AttributeResolver: Send + Sync {
    fn resolve(&self, ctx: &AttributeContext<'_>) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    RemoteAddr,
    RemoteIp,
    RequestId,
    Host,
    Method,
    Path,
    Scheme,
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateAttribute {
    parts: Vec<Part>,
}

impl TemplateAttribute {
    pub fn parse(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(start) = rest.find("%{") {
            let Some(len) = rest[start + 2..].find('}') else {
                break;
            };
            let name = &rest[start + 2..start + 2 + len];
            let part = match name {
                "remote_addr" => Some(Part::RemoteAddr),
                "remote_ip" => Some(Part::RemoteIp),
                "request_id" => Some(Part::RequestId),
                "host" => Some(Part::Host),
                "method" => Some(Part::Method),
                "path" => Some(Part::Path),
                "scheme" => Some(Part::Scheme),
                _ => None,
            };
            let end = start + 2 + len + 1;
            match part {
                Some(part) => {
                    literal.push_str(&rest[..start]);
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(part);
                }
                None => literal.push_str(&rest[..end]),
            }
            rest = &rest[end..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Self { parts }
    }

    /// Whether the template has no placeholders.
    pub fn is_constant(&self) -> bool {
        self.parts.iter().all(|part| matches!(part, Part::Literal(_)))
    }
}

impl AttributeResolver for TemplateAttribute {
    fn resolve(&self, ctx: &AttributeContext<'_>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::RemoteAddr => out.push_str(&ctx.remote_addr.to_string()),
                Part::RemoteIp => out.push_str(&ctx.remote_addr.ip().to_string()),
                Part::RequestId => out.push_str(ctx.request_id.unwrap_or_default()),
                Part::Host => out.push_str(ctx.host.unwrap_or_default()),
                Part::Method => out.push_str(ctx.method),
                Part::Path => out.push_str(ctx.path),
                Part::Scheme => out.push_str(ctx.scheme),
            }
        }
        out
    }
}
