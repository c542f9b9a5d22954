//! INI document parser for WireGuard-style configuration files.
//!
//! The accepted dialect follows wg-quick profiles: `#` or `;` starts a
//! comment, keys are case-insensitive, the same key may appear more than
//! once within a section (shadowed keys), and the same section name may
//! appear more than once (e.g. multiple `[Peer]` blocks).

use crate::common::Error;

/// One `[Section]` block. Keys are stored lowercased, in file order,
/// duplicates included.
#[derive(Debug, Clone)]
pub struct IniSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            entries: Vec::new(),
        }
    }

    /// Last value wins for shadowed keys.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a shadowed key, in file order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// A parsed INI document: the implicit root section followed by the named
/// sections in file order.
#[derive(Debug, Clone)]
pub struct IniDocument {
    pub root: IniSection,
    pub sections: Vec<IniSection>,
}

impl IniDocument {
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut root = IniSection::new("");
        let mut sections: Vec<IniSection> = Vec::new();
        let mut current: Option<IniSection> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') {
                    return Err(Error::Config(format!(
                        "unterminated section header at line {}: {}",
                        line_no, raw
                    )));
                }
                if let Some(done) = current.take() {
                    sections.push(done);
                }
                current = Some(IniSection::new(&line[1..line.len() - 1]));
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("invalid syntax at line {}: {}", line_no, raw))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if key.is_empty() {
                return Err(Error::Config(format!(
                    "empty key at line {}: {}",
                    line_no, raw
                )));
            }

            match current.as_mut() {
                Some(section) => section.entries.push((key, value)),
                None => root.entries.push((key, value)),
            }
        }

        if let Some(done) = current.take() {
            sections.push(done);
        }

        Ok(Self { root, sections })
    }

    /// All sections with the given (case-insensitive) name, in file order.
    pub fn sections_named(&self, name: &str) -> Vec<&IniSection> {
        let name = name.to_ascii_lowercase();
        self.sections.iter().filter(|s| s.name == name).collect()
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        let name = name.to_ascii_lowercase();
        self.sections.iter().find(|s| s.name == name)
    }
}

fn strip_comment(line: &str) -> &str {
    let end = line
        .find(|c| c == '#' || c == ';')
        .unwrap_or(line.len());
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sections_and_keys() {
        let doc = IniDocument::parse(
            "[Interface]\nPrivateKey = abc\nMTU=1280\n\n[Peer]\nPublicKey = xyz\n",
        )
        .unwrap();
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.section("interface").unwrap().get("privatekey"), Some("abc"));
        assert_eq!(doc.section("Interface").unwrap().get("MTU"), Some("1280"));
        assert_eq!(doc.section("peer").unwrap().get("PublicKey"), Some("xyz"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let doc = IniDocument::parse("[S]\nBindAddress = 1.2.3.4:1080\n").unwrap();
        assert_eq!(doc.section("s").unwrap().get("bindaddress"), Some("1.2.3.4:1080"));
    }

    #[test]
    fn comments_stripped() {
        let doc = IniDocument::parse(
            "# leading comment\n[Interface]\nMTU = 1420 # trailing\n; full line\nDNS = 1.1.1.1\n",
        )
        .unwrap();
        let s = doc.section("interface").unwrap();
        assert_eq!(s.get("mtu"), Some("1420"));
        assert_eq!(s.get("dns"), Some("1.1.1.1"));
    }

    #[test]
    fn shadowed_keys_last_wins() {
        let doc = IniDocument::parse("[S]\nTarget = a:1\nTarget = b:2\n").unwrap();
        let s = doc.section("s").unwrap();
        assert_eq!(s.get("target"), Some("b:2"));
        assert_eq!(s.get_all("target"), vec!["a:1", "b:2"]);
    }

    #[test]
    fn repeated_sections_kept() {
        let doc = IniDocument::parse("[Peer]\nPublicKey=a\n[Peer]\nPublicKey=b\n").unwrap();
        let peers = doc.sections_named("peer");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].get("publickey"), Some("a"));
        assert_eq!(peers[1].get("publickey"), Some("b"));
    }

    #[test]
    fn root_entries_before_first_section() {
        let doc = IniDocument::parse("WGConfig = /etc/wg0.conf\n[Socks5]\nBindAddress=x:1\n").unwrap();
        assert_eq!(doc.root.get("wgconfig"), Some("/etc/wg0.conf"));
    }

    #[test]
    fn invalid_line_rejected() {
        assert!(IniDocument::parse("[S]\nno equals sign\n").is_err());
    }

    #[test]
    fn unterminated_section_rejected() {
        assert!(IniDocument::parse("[Broken\n").is_err());
    }
}
