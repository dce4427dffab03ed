//! HTTP `Host:` header extraction.

/// Locate the hostname in a plain HTTP request.
///
/// Returns the offset of the value of the first `Host: ` header (the
/// marker match is case-sensitive, trailing space included) and its
/// length up to the closing CRLF.
pub fn find_host(buf: &[u8]) -> Option<(usize, usize)> {
    let offset = find(buf, b"Host: ")? + 6;
    let length = find(&buf[offset..], b"\r\n")?;
    Some((offset, length))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_value_range() {
        let req = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let (offset, length) = find_host(req).unwrap();
        assert_eq!(&req[offset..offset + length], b"example.com");
    }

    #[test]
    fn missing_header_or_crlf_is_none() {
        assert!(find_host(b"GET / HTTP/1.1\r\n\r\n").is_none());
        // header present but never terminated
        assert!(find_host(b"GET / HTTP/1.1\r\nHost: example.com").is_none());
        assert!(find_host(b"").is_none());
    }

    #[test]
    fn marker_is_case_sensitive() {
        assert!(find_host(b"GET / HTTP/1.1\r\nhost: example.com\r\n\r\n").is_none());
    }

    #[test]
    fn empty_host_value() {
        let req = b"GET / HTTP/1.1\r\nHost: \r\n\r\n";
        let (_, length) = find_host(req).unwrap();
        assert_eq!(length, 0);
    }
}
