use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest is not valid UTF-8 or UTF-16 text")]
    Encoding,
    #[error("malformed manifest XML at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
    #[error("manifest has no <Identity> element")]
    MissingIdentity,
    #[error("<Identity> is missing the '{0}' attribute")]
    MissingIdentityAttribute(&'static str),
    #[error("<Application> element #{0} is missing the 'Id' attribute")]
    MissingApplicationId(usize),
}

/// The parts of an `AppxManifest.xml` the launcher needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub identity: ManifestIdentity,
    /// Declared entry points, in document order.
    pub applications: Vec<ManifestApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestIdentity {
    pub name: String,
    pub publisher: String,
    pub version: String,
    #[serde(default)]
    pub processor_architecture: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestApplication {
    pub id: String,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<PackageManifest, ManifestError> {
    let bytes = fs::read(path)?;
    parse_manifest_str(&decode_text(&bytes)?)
}

pub fn parse_manifest_str(input: &str) -> Result<PackageManifest, ManifestError> {
    let mut scanner = Scanner::new(input);
    let mut stack: Vec<&str> = Vec::new();
    let mut identity = None;
    let mut applications = Vec::new();

    while let Some(token) = scanner.next_token()? {
        match token {
            Token::Open(element) => {
                let parent = stack.last().copied();
                match (parent, element.name) {
                    (Some("Package"), "Identity") if identity.is_none() => {
                        identity = Some(read_identity(&element)?);
                    }
                    (Some("Applications"), "Application") => {
                        let id = element
                            .attr("Id")
                            .ok_or(ManifestError::MissingApplicationId(applications.len() + 1))?;
                        applications.push(ManifestApplication {
                            id: id.to_owned(),
                            executable: element.attr("Executable").map(str::to_owned),
                            entry_point: element.attr("EntryPoint").map(str::to_owned),
                        });
                    }
                    _ => {}
                }
                if !element.self_closing {
                    stack.push(element.name);
                }
            }
            Token::Close(name) => match stack.pop() {
                Some(open) if open == name => {}
                _ => {
                    return Err(ManifestError::Malformed {
                        offset: scanner.pos,
                        reason: "mismatched closing tag",
                    })
                }
            },
        }
    }

    if !stack.is_empty() {
        return Err(ManifestError::Malformed {
            offset: scanner.pos,
            reason: "unclosed element at end of document",
        });
    }

    Ok(PackageManifest {
        identity: identity.ok_or(ManifestError::MissingIdentity)?,
        applications,
    })
}

fn read_identity(element: &Element<'_>) -> Result<ManifestIdentity, ManifestError> {
    let required = |name: &'static str| {
        element
            .attr(name)
            .map(str::to_owned)
            .ok_or(ManifestError::MissingIdentityAttribute(name))
    };
    Ok(ManifestIdentity {
        name: required("Name")?,
        publisher: required("Publisher")?,
        version: required("Version")?,
        processor_architecture: element.attr("ProcessorArchitecture").map(str::to_owned),
        resource_id: element.attr("ResourceId").map(str::to_owned),
    })
}

/// Manifests produced by tooling are UTF-8, but hand-edited ones are
/// occasionally saved as UTF-16 with a byte order mark.
fn decode_text(bytes: &[u8]) -> Result<String, ManifestError> {
    let utf16 = |le: bool| {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| {
                if le {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        String::from_utf16(&units).map_err(|_| ManifestError::Encoding)
    };
    match bytes {
        [0xFF, 0xFE, ..] => utf16(true),
        [0xFE, 0xFF, ..] => utf16(false),
        [0xEF, 0xBB, 0xBF, rest @ ..] => {
            String::from_utf8(rest.to_vec()).map_err(|_| ManifestError::Encoding)
        }
        _ => String::from_utf8(bytes.to_vec()).map_err(|_| ManifestError::Encoding),
    }
}

struct Element<'a> {
    /// Local name, namespace prefix stripped.
    name: &'a str,
    attrs: Vec<(&'a str, String)>,
    self_closing: bool,
}

impl Element<'_> {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(attr_name, _)| *attr_name == name)
            .map(|(_, value)| value.as_str())
    }
}

enum Token<'a> {
    Open(Element<'a>),
    Close(&'a str),
}

fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

/// Minimal pull scanner over element tags. Text, comments, processing
/// instructions, CDATA and doctype declarations are skipped.
struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        let src = src.strip_prefix('\u{feff}').unwrap_or(src);
        Self { src, pos: 0 }
    }

    fn malformed(&self, reason: &'static str) -> ManifestError {
        ManifestError::Malformed {
            offset: self.pos,
            reason,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_past(&mut self, terminator: &str, reason: &'static str) -> Result<(), ManifestError> {
        match self.rest().find(terminator) {
            Some(idx) => {
                self.pos += idx + terminator.len();
                Ok(())
            }
            None => Err(self.malformed(reason)),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token<'a>>, ManifestError> {
        loop {
            let Some(idx) = self.rest().find('<') else {
                self.pos = self.src.len();
                return Ok(None);
            };
            self.pos += idx;
            let rest = self.rest();

            if rest.starts_with("<?") {
                self.skip_past("?>", "unterminated processing instruction")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->", "unterminated comment")?;
            } else if rest.starts_with("<![CDATA[") {
                self.skip_past("]]>", "unterminated CDATA section")?;
            } else if rest.starts_with("<!") {
                self.skip_past(">", "unterminated declaration")?;
            } else if let Some(after) = rest.strip_prefix("</") {
                let end = after
                    .find('>')
                    .ok_or_else(|| self.malformed("unterminated closing tag"))?;
                let name = local_name(after[..end].trim());
                self.pos += 2 + end + 1;
                return Ok(Some(Token::Close(name)));
            } else {
                return self.open_tag().map(|el| Some(Token::Open(el)));
            }
        }
    }

    fn open_tag(&mut self) -> Result<Element<'a>, ManifestError> {
        let src = self.src;
        let bytes = src.as_bytes();
        let start = self.pos + 1;
        let mut cursor = start;
        while cursor < bytes.len()
            && !matches!(bytes[cursor], b'/' | b'>')
            && !bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        if cursor == start {
            return Err(self.malformed("empty element name"));
        }
        let name = local_name(&src[start..cursor]);

        let mut attrs = Vec::new();
        loop {
            while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            match bytes.get(cursor) {
                None => {
                    self.pos = cursor;
                    return Err(self.malformed("unterminated element tag"));
                }
                Some(b'>') => {
                    self.pos = cursor + 1;
                    return Ok(Element {
                        name,
                        attrs,
                        self_closing: false,
                    });
                }
                Some(b'/') => {
                    if bytes.get(cursor + 1) != Some(&b'>') {
                        self.pos = cursor;
                        return Err(self.malformed("stray '/' in element tag"));
                    }
                    self.pos = cursor + 2;
                    return Ok(Element {
                        name,
                        attrs,
                        self_closing: true,
                    });
                }
                Some(_) => {}
            }

            let attr_start = cursor;
            while cursor < bytes.len()
                && bytes[cursor] != b'='
                && !bytes[cursor].is_ascii_whitespace()
                && !matches!(bytes[cursor], b'/' | b'>')
            {
                cursor += 1;
            }
            let attr_name = local_name(&src[attr_start..cursor]);
            while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            if bytes.get(cursor) != Some(&b'=') {
                self.pos = cursor;
                return Err(self.malformed("attribute without value"));
            }
            cursor += 1;
            while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            let quote = match bytes.get(cursor) {
                Some(q @ (b'"' | b'\'')) => *q,
                _ => {
                    self.pos = cursor;
                    return Err(self.malformed("unquoted attribute value"));
                }
            };
            cursor += 1;
            let value_start = cursor;
            while cursor < bytes.len() && bytes[cursor] != quote {
                cursor += 1;
            }
            if cursor >= bytes.len() {
                self.pos = value_start;
                return Err(self.malformed("unterminated attribute value"));
            }
            attrs.push((attr_name, decode_entities(&src[value_start..cursor])));
            cursor += 1;
        }
    }
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_owned();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        if let Some(ch) = decoded {
            out.push(ch);
            rest = &rest[semi + 1..];
        } else {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}
