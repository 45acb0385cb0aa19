//! Release metadata: version triples and the minimal scan that pulls the
//! release name and first asset URL out of the endpoint's JSON body.
//!
//! The body is bounded but parsing must not block the control loop, so the
//! extractor is a single forward scan over the raw bytes; no JSON tree is
//! materialized.

use serde::Serialize;

/// Semantic version triple with lexicographic ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `MAJOR.MINOR.PATCH`, with or without a leading `v`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "version")]
pub enum ReleaseCheckState {
    #[default]
    Idle,
    Waiting,
    Done(Version),
    Error,
}

/// True iff the published release is strictly newer than the running one.
pub fn update_available(current: Version, latest: Version) -> bool {
    latest > current
}

/// Release name and download URL extracted from the endpoint body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub url: String,
}

/// Scan the raw response body for the top-level `"name"` string and the
/// `"url"` string of the first element of the top-level `"assets"` array.
/// Returns `None` when either is missing or the body is not the expected
/// shape; the caller collapses that to its error state.
pub fn extract_release(body: &str) -> Option<ReleaseInfo> {
    let mut scan = Scanner::new(body.as_bytes());
    scan.expect(b'{')?;

    let mut name: Option<String> = None;
    let mut url: Option<String> = None;

    loop {
        scan.skip_ws();
        match scan.peek()? {
            b'}' => break,
            b',' => {
                scan.bump();
                continue;
            }
            _ => {}
        }
        let key = scan.string()?;
        scan.expect(b':')?;
        match key.as_str() {
            "name" => name = Some(scan.string()?),
            "assets" => url = first_asset_url(&mut scan),
            _ => scan.skip_value()?,
        }
        if name.is_some() && url.is_some() {
            break;
        }
    }

    Some(ReleaseInfo {
        name: name?,
        url: url?,
    })
}

/// Descend into the assets array and pull `"url"` out of its first object,
/// consuming the whole array so the caller's scan position stays valid.
fn first_asset_url(scan: &mut Scanner<'_>) -> Option<String> {
    scan.expect(b'[')?;
    scan.skip_ws();
    let mut url = None;
    match scan.peek()? {
        b']' => {
            scan.bump();
            return None;
        }
        b'{' => scan.bump(),
        _ => return None,
    }
    loop {
        scan.skip_ws();
        match scan.peek()? {
            b'}' => {
                scan.bump();
                break;
            }
            b',' => {
                scan.bump();
                continue;
            }
            _ => {}
        }
        let key = scan.string()?;
        scan.expect(b':')?;
        if key == "url" && url.is_none() {
            url = Some(scan.string()?);
        } else {
            scan.skip_value()?;
        }
    }
    // Later assets are ignored but still consumed.
    loop {
        scan.skip_ws();
        match scan.peek()? {
            b']' => {
                scan.bump();
                break;
            }
            b',' => {
                scan.bump();
                scan.skip_value()?;
            }
            _ => return None,
        }
    }
    url
}

/// Forward-only cursor over the body bytes.
struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.bump();
        }
    }

    fn expect(&mut self, token: u8) -> Option<()> {
        self.skip_ws();
        if self.peek()? == token {
            self.bump();
            Some(())
        } else {
            None
        }
    }

    /// Parse a string value, resolving only the escapes the endpoint emits
    /// in names and URLs.
    fn string(&mut self) -> Option<String> {
        self.expect(b'"')?;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let c = self.peek()?;
            self.bump();
            match c {
                b'"' => return String::from_utf8(out).ok(),
                b'\\' => {
                    let esc = self.peek()?;
                    self.bump();
                    match esc {
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        // Anything fancier is not expected from the
                        // endpoint; keep the raw escape so the caller's
                        // version parse fails loudly instead of silently
                        // mangling.
                        other => {
                            out.push(b'\\');
                            out.push(other);
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }

    /// Skip one complete JSON value, whatever its type.
    fn skip_value(&mut self) -> Option<()> {
        self.skip_ws();
        match self.peek()? {
            b'"' => {
                self.string()?;
            }
            open @ (b'{' | b'[') => {
                let close = if open == b'{' { b'}' } else { b']' };
                self.bump();
                let mut depth = 1usize;
                while depth > 0 {
                    match self.peek()? {
                        b'"' => {
                            self.string()?;
                            continue;
                        }
                        c if c == open => depth += 1,
                        c if c == close => depth -= 1,
                        _ => {}
                    }
                    self.bump();
                }
            }
            _ => {
                // Number, bool or null: consume until a delimiter.
                while let Some(c) = self.peek() {
                    if matches!(c, b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n') {
                        break;
                    }
                    self.bump();
                }
            }
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_accepts_both_forms() {
        assert_eq!(Version::parse("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(Version::parse("0.10.2"), Some(Version::new(0, 10, 2)));
        assert_eq!(Version::parse("v1.2"), None);
        assert_eq!(Version::parse("1.2.3.4"), None);
        assert_eq!(Version::parse("release-1.2.3"), None);
    }

    #[test]
    fn version_ordering_is_lexicographic() {
        assert!(update_available(Version::new(0, 1, 2), Version::new(0, 1, 3)));
        assert!(!update_available(Version::new(0, 1, 2), Version::new(0, 1, 2)));
        assert!(!update_available(Version::new(1, 0, 0), Version::new(0, 9, 9)));
    }

    #[test]
    fn extracts_name_and_first_asset_url() {
        let body = r#"{"name":"v1.2.3","assets":[{"url":"https://x/y"}]}"#;
        let info = extract_release(body).unwrap();
        assert_eq!(info.name, "v1.2.3");
        assert_eq!(info.url, "https://x/y");
        assert!(update_available(
            Version::new(0, 1, 2),
            Version::parse(&info.name).unwrap()
        ));
    }

    #[test]
    fn tolerates_extra_fields_and_nesting() {
        let body = r#"{
            "id": 991,
            "author": {"login": "clock-bot", "meta": [1, 2, {"x": "]"}]},
            "name": "2.0.11",
            "prerelease": false,
            "assets": [
                {"id": 5, "label": null, "url": "https://host/asset/5"},
                {"id": 6, "url": "https://host/asset/6"}
            ]
        }"#;
        let info = extract_release(body).unwrap();
        assert_eq!(info.name, "2.0.11");
        assert_eq!(info.url, "https://host/asset/5");
    }

    #[test]
    fn assets_listed_before_name_still_extracts() {
        let body = r#"{"assets":[{"url":"https://h/a"}],"name":"v0.4.0"}"#;
        let info = extract_release(body).unwrap();
        assert_eq!(info.url, "https://h/a");
        assert_eq!(info.name, "v0.4.0");
    }

    #[test]
    fn missing_pieces_fail_the_extraction() {
        assert!(extract_release(r#"{"name":"v1.0.0","assets":[]}"#).is_none());
        assert!(extract_release(r#"{"assets":[{"url":"https://x"}]}"#).is_none());
        assert!(extract_release(r#"{"name":"v1.0.0"}"#).is_none());
        assert!(extract_release("not json at all").is_none());
        assert!(extract_release("").is_none());
    }
}
