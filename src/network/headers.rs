//! Raw response header line handling and request header construction
//!
//! Response headers arrive one raw line at a time (`Name: value\r\n`).
//! Only the few headers the engine acts on are picked out here; every line
//! is still forwarded to the fetch owner verbatim.

use super::config::FetchConfig;

/// Longest `Accept-*` header line the engine will emit
const MAX_ACCEPT_LINE: usize = 79;

/// A response header the engine acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialHeader<'a> {
    /// `Location`, trimmed of surrounding whitespace
    Location(&'a str),
    /// `Content-Length`
    ContentLength(u64),
    /// First `realm="..."` of a `WWW-Authenticate` challenge
    Realm(&'a str),
    /// Raw `Set-Cookie` value
    SetCookie(&'a str),
}

fn strip_name<'a>(line: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let n = name.len();
    if line.len() > n && line[..n].eq_ignore_ascii_case(name.as_bytes()) {
        Some(skip_blanks(&line[n..]))
    } else {
        None
    }
}

fn skip_blanks(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Pick the engine-relevant header out of one raw line, if any
pub fn parse_special(line: &[u8]) -> Option<SpecialHeader<'_>> {
    if let Some(rest) = strip_name(line, "Location:") {
        let value = std::str::from_utf8(trim_end(rest)).ok()?;
        if value.is_empty() {
            return None;
        }
        return Some(SpecialHeader::Location(value));
    }

    if let Some(rest) = strip_name(line, "Content-Length:") {
        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let value = std::str::from_utf8(&rest[..digits]).ok()?;
        return value.parse().ok().map(SpecialHeader::ContentLength);
    }

    if let Some(rest) = strip_name(line, "WWW-Authenticate:") {
        return extract_realm(rest).map(SpecialHeader::Realm);
    }

    if let Some(rest) = strip_name(line, "Set-Cookie:") {
        let value = std::str::from_utf8(trim_end(rest)).ok()?;
        return Some(SpecialHeader::SetCookie(value));
    }

    None
}

/// First quoted realm in a challenge: `Basic realm="Members"` yields `Members`
fn extract_realm(challenge: &[u8]) -> Option<&str> {
    let at = challenge
        .windows(5)
        .position(|w| w.eq_ignore_ascii_case(b"realm"))?;
    let rest = &challenge[at + 5..];
    let open = rest.iter().position(|b| *b == b'"')?;
    let rest = &rest[open + 1..];
    let close = rest.iter().position(|b| *b == b'"')?;
    std::str::from_utf8(&rest[..close]).ok()
}

fn accept_line(name: &str, value: &str) -> String {
    let mut line = format!("{name}: {value}, *;q=0.1");
    if line.len() > MAX_ACCEPT_LINE {
        let mut cut = MAX_ACCEPT_LINE;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
    }
    line
}

/// Build the outgoing header list for a fetch.
///
/// A line of the form `Name:` with no value removes a header the transport
/// would otherwise add by default.
pub fn build_request_headers(config: &FetchConfig, extra: &[String]) -> Vec<String> {
    let mut headers = Vec::with_capacity(extra.len() + 5);

    headers.push("Pragma:".to_string());
    // Expect: 100-continue on POST breaks some servers
    headers.push("Expect:".to_string());

    if let Some(lang) = config.accept_language.as_deref().filter(|s| !s.is_empty()) {
        headers.push(accept_line("Accept-Language", lang));
    }
    if let Some(charset) = config.accept_charset.as_deref().filter(|s| !s.is_empty()) {
        headers.push(accept_line("Accept-Charset", charset));
    }
    if config.do_not_track {
        headers.push("DNT: 1".to_string());
    }

    headers.extend(extra.iter().cloned());
    headers
}

/// Split a request header line into name and value.
///
/// Returns `None` for malformed lines; an empty value marks a removal.
pub fn split_request_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}
