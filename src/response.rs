// src/response.rs
//
// End-of-headers detection and assembly of the one response this server
// knows how to send.

/// The HTTP header terminator. Requests are never parsed beyond finding it.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Body of the canned response, byte-identical on every connection.
pub const HTML_BODY: &str = "<html><body>\
<h1>arclight</h1>\
<p>served from a fixed buffer</p>\
</body></html>";

/// Payload sent before closing a descriptor that exceeds the connection
/// table's capacity.
pub const REJECT_PAYLOAD: &[u8] = b"Error.";

/// True once the accumulated request bytes contain `\r\n\r\n`. The scan
/// covers everything buffered so far, so the result only depends on the
/// cumulative byte stream, never on how it was chunked across reads. Buffers
/// shorter than the terminator simply produce no windows to inspect.
pub fn headers_complete(buf: &[u8]) -> bool {
    buf.windows(HEADER_TERMINATOR.len())
        .any(|w| w == HEADER_TERMINATOR)
}

/// Build the full response in a single buffer sized to its exact length:
/// fixed header block, Content-Length computed from the body bytes, then the
/// body itself. The connection is closed after this is flushed, and the
/// headers say so.
pub fn render() -> Vec<u8> {
    let body = HTML_BODY.as_bytes();
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=UTF-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_fragmentation_invariant() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n";
        // Feed the request one byte at a time; completion must trip exactly
        // when the cumulative prefix first contains the terminator, which for
        // this request is its final byte.
        for end in 1..=request.len() {
            let complete = headers_complete(&request[..end]);
            assert_eq!(
                complete,
                end == request.len(),
                "unexpected completion verdict after {} bytes",
                end
            );
        }
    }

    #[test]
    fn terminator_in_the_middle_counts() {
        assert!(headers_complete(b"HEAD / HTTP/1.1\r\n\r\ntrailing junk"));
    }

    #[test]
    fn short_buffers_do_not_panic() {
        assert!(!headers_complete(b""));
        assert!(!headers_complete(b"\r"));
        assert!(!headers_complete(b"\r\n"));
        assert!(!headers_complete(b"\r\n\r"));
        assert!(headers_complete(b"\r\n\r\n"));
    }

    #[test]
    fn bare_newlines_are_not_a_boundary() {
        assert!(!headers_complete(b"GET / HTTP/1.0\n\n"));
        assert!(!headers_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"));
    }

    #[test]
    fn render_declares_the_exact_body_length() {
        let resp = render();
        let text = std::str::from_utf8(&resp).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html; charset=UTF-8\r\n"));
        assert!(text.contains("Connection: close\r\n"));

        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let body = &text[body_start..];
        assert_eq!(body, HTML_BODY);
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));

        // Allocated once, sized exactly.
        assert_eq!(resp.capacity(), resp.len());
    }
}
