//! Descriptor templates and live-descriptor parsing
//!
//! Templates are plain text with `{placeholder}` markers; `{{` and `}}`
//! stand for literal braces. Parsing is deliberately shallow: the harness
//! only needs a few well-known elements out of libvirt XML.

use once_cell::sync::Lazy;
use regex::Regex;
use sightline_common::{Endpoint, Error, Result};
use std::path::Path;

/// Built-in directory pool
pub const DEFAULT_POOL_TEMPLATE: &str = "<pool type='dir'>
  <name>{name}</name>
  <target>
    <path>{path}</path>
  </target>
</pool>
";

static GRAPHICS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<graphics\b([^>]*?)(/?)>").expect("valid regex"));
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w:-]+)\s*=\s*(?:'([^']*)'|"([^"]*)")"#).expect("valid regex"));
static LISTEN_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<listen\b[^>]*?\baddress\s*=\s*(?:'([^']*)'|"([^"]*)")"#).expect("valid regex")
});
static POOL_TARGET_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<target>.*?<path>\s*([^<]*?)\s*</path>").expect("valid regex")
});

/// Values substituted into one template
#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    vars: Vec<(&'static str, String)>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` to every name in `names`
    pub fn set(mut self, names: &[&'static str], value: impl Into<String>) -> Self {
        let value = value.into();
        for name in names {
            self.vars.retain(|(n, _)| n != name);
            self.vars.push((name, value.clone()));
        }
        self
    }

    pub fn with_id(self, id: u32) -> Self {
        self.set(&["id", "number"], id.to_string())
    }

    pub fn with_pool_path(self, path: &Path) -> Self {
        self.set(&["pool_path", "path"], path.to_string_lossy())
    }

    pub fn with_boot_medium(self, boot_medium: &str) -> Self {
        self.set(&["boot_medium", "iso_file"], boot_medium)
    }

    pub fn with_disk_path(self, path: &Path) -> Self {
        self.set(&["disk_path", "disk_file"], path.to_string_lossy())
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Substitute every `{placeholder}` in `template`
pub fn render(template: &str, vars: &TemplateVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &template[pos + 1..];
                let end = rest.find('}').ok_or_else(|| {
                    Error::Template(format!("unterminated placeholder at byte {}", pos))
                })?;
                let name = &rest[..end];
                let value = vars
                    .get(name)
                    .ok_or_else(|| Error::Template(format!("unknown placeholder {{{}}}", name)))?;
                out.push_str(value);
                for _ in 0..=name.chars().count() {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Trimmed text of the first `<tag>` element
pub fn element_text(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"(?s)<{tag}(?:\s[^>]*)?>\s*([^<]*?)\s*</{tag}>",
        tag = regex::escape(tag)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

/// Name declared by a descriptor
pub fn declared_name(xml: &str, what: &str) -> Result<String> {
    element_text(xml, "name")
        .ok_or_else(|| Error::Template(format!("{} descriptor has no <name> element", what)))
}

/// Target path declared by a pool descriptor
pub fn pool_target_path(xml: &str) -> Option<String> {
    POOL_TARGET_PATH
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Remote-display endpoint of a live machine descriptor
pub fn graphics_endpoint(xml: &str) -> Result<Endpoint> {
    let graphics = GRAPHICS.captures(xml).ok_or_else(|| {
        Error::infrastructure("machine descriptor has no <graphics> element")
    })?;
    let attrs = graphics.get(1).map(|m| m.as_str()).unwrap_or_default();
    let self_closing = graphics.get(2).map_or(false, |m| !m.as_str().is_empty());

    let attr = |name: &str| {
        ATTRIBUTE.captures_iter(attrs).find_map(|c| {
            (c.get(1)?.as_str() == name)
                .then(|| c.get(2).or_else(|| c.get(3)).map(|m| m.as_str().to_string()))
                .flatten()
        })
    };

    let port = attr("port")
        .ok_or_else(|| Error::infrastructure("<graphics> element has no port attribute"))?;
    let port: u16 = match port.trim().parse::<i64>() {
        Ok(p) if p > 0 && p <= u16::MAX as i64 => p as u16,
        _ => {
            return Err(Error::infrastructure(format!(
                "<graphics> port '{}' is not an assigned port",
                port
            )))
        }
    };

    let mut host = attr("listen");
    if host.is_none() && !self_closing {
        let body_start = graphics.get(0).map_or(0, |m| m.end());
        let body = &xml[body_start..];
        let body = &body[..body.find("</graphics>").unwrap_or(body.len())];
        host = LISTEN_ADDRESS
            .captures(body)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string());
    }

    Ok(Endpoint::new(resolve_listen(host.as_deref()), port))
}

fn resolve_listen(listen: Option<&str>) -> String {
    match listen.map(str::trim) {
        None | Some("") | Some("0.0.0.0") | Some("::") | Some("[::]") => "127.0.0.1".to_string(),
        Some(host) => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const STORAGE: &str = "<volume>
  <name>disk{id}.qcow2</name>
  <capacity unit='G'>16</capacity>
  <target><path>{pool_path}/disk{number}.qcow2</path><format type='qcow2'/></target>
</volume>";

    #[test]
    fn test_render_with_aliases() {
        let vars = TemplateVars::new()
            .with_id(7)
            .with_pool_path(&PathBuf::from("/var/lib/pool"));
        let xml = render(STORAGE, &vars).unwrap();
        assert!(xml.contains("<name>disk7.qcow2</name>"));
        assert!(xml.contains("<path>/var/lib/pool/disk7.qcow2</path>"));
    }

    #[test]
    fn test_render_escapes_and_unknowns() {
        let vars = TemplateVars::new().with_id(1);
        assert_eq!(render("a{{b}}{id}", &vars).unwrap(), "a{b}1");
        assert!(matches!(render("{ram}", &vars), Err(Error::Template(_))));
        assert!(matches!(render("{id", &vars), Err(Error::Template(_))));
    }

    #[test]
    fn test_element_text() {
        let xml = "<domain type='kvm'>\n  <name> alfa-3 </name>\n  <memory>2097152</memory></domain>";
        assert_eq!(element_text(xml, "name").as_deref(), Some("alfa-3"));
        assert_eq!(element_text(xml, "uuid"), None);
        assert!(declared_name("<pool/>", "pool").is_err());
    }

    #[test]
    fn test_pool_target_path() {
        let xml = "<pool type='dir'><name>p</name><target>\n <path>/srv/pool</path>\n</target></pool>";
        assert_eq!(pool_target_path(xml).as_deref(), Some("/srv/pool"));
    }

    #[test]
    fn test_graphics_with_listen_attribute() {
        let xml = "<domain><devices><graphics type='vnc' port='5903' autoport='yes' listen='192.168.1.5'>\
                   <listen type='address' address='192.168.1.5'/></graphics></devices></domain>";
        let ep = graphics_endpoint(xml).unwrap();
        assert_eq!(ep, Endpoint::new("192.168.1.5", 5903));
    }

    #[test]
    fn test_graphics_with_nested_listen_and_wildcard() {
        let xml = r#"<graphics type="vnc" port="5900" autoport="yes">
            <listen type="address" address="0.0.0.0"/>
          </graphics>"#;
        assert_eq!(graphics_endpoint(xml).unwrap(), Endpoint::new("127.0.0.1", 5900));

        let xml = "<graphics type='vnc' port='5901'/>";
        assert_eq!(graphics_endpoint(xml).unwrap(), Endpoint::new("127.0.0.1", 5901));
    }

    #[test]
    fn test_graphics_missing_or_unassigned() {
        assert!(graphics_endpoint("<domain><devices/></domain>")
            .unwrap_err()
            .is_infrastructure());
        assert!(graphics_endpoint("<graphics type='vnc' autoport='yes'/>").is_err());
        assert!(graphics_endpoint("<graphics type='vnc' port='-1' autoport='yes'/>").is_err());
    }
}
